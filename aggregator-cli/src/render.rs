//! Plain-text formatting for terminal output.

use std::fmt::Write;

use aggregator_core::{ConsensusCurrent, ConsensusForecast, RefreshReport, SchedulerStatus, Stats};
use chrono::{DateTime, Utc};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M UTC";

fn time(t: &DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

pub fn current(w: &ConsensusCurrent) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}: {} ({})", w.city, w.description, w.icon);
    let _ = writeln!(out, "  Temperature: {:.1}°C (feels like {:.1}°C)", w.temperature_c, w.feels_like_c);
    let _ = writeln!(out, "  Humidity:    {:.0}%", w.humidity_pct);
    let _ = writeln!(out, "  Pressure:    {:.0} hPa", w.pressure_hpa);
    let _ = writeln!(out, "  Wind:        {:.1} m/s", w.wind_speed_mps);
    let _ = writeln!(
        out,
        "  Confidence:  {:.0}% from {} source(s): {}",
        w.confidence * 100.0,
        w.sources.len(),
        w.sources.join(", ")
    );
    let _ = writeln!(out, "  Updated:     {}", time(&w.last_updated));
    out
}

pub fn forecast(f: &ConsensusForecast) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}: {}-day forecast from {}",
        f.city,
        f.days.len(),
        f.sources.join(", ")
    );
    for day in &f.days {
        let _ = writeln!(
            out,
            "  {}  {:>5.1} / {:>5.1}°C  {:>5.1} mm  {:>3.0}%  {}",
            day.date.format("%a %Y-%m-%d"),
            day.max_temp_c,
            day.min_temp_c,
            day.precipitation_mm,
            day.humidity_pct,
            day.description
        );
    }
    out
}

pub fn report(r: &RefreshReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Refreshed {} city(ies), {} failed",
        r.succeeded.len(),
        r.failed.len()
    );
    for (city, err) in &r.failed {
        let _ = writeln!(out, "  {city}: {err}");
    }
    out
}

pub fn stats(s: &Stats) -> String {
    let last_fetch = s
        .last_fetch_time
        .as_ref()
        .map(time)
        .unwrap_or_else(|| "never".to_string());

    let mut out = String::new();
    let _ = writeln!(out, "Last fetch:     {last_fetch}");
    let _ = writeln!(out, "Successes:      {}", s.success_count);
    let _ = writeln!(out, "Failures:       {}", s.failure_count);
    let _ = writeln!(out, "Cities tracked: {}", s.cities_tracked);
    let _ = writeln!(out, "Sources:        {}", s.active_sources);
    let _ = writeln!(
        out,
        "Cache:          {} current, {} forecast ({}/{})",
        s.cache.current_items,
        s.cache.forecast_items,
        s.cache.occupancy(),
        s.cache.max_size
    );
    out
}

pub fn scheduler_status(s: &SchedulerStatus) -> String {
    let next = s
        .next_run
        .as_ref()
        .map(time)
        .unwrap_or_else(|| "-".to_string());
    let last = s
        .last_run
        .as_ref()
        .map(time)
        .unwrap_or_else(|| "never".to_string());

    format!(
        "Scheduler {} every {}s for [{}], last run {last}, next run {next}\n",
        if s.running { "running" } else { "stopped" },
        s.interval.as_secs(),
        s.cities.join(", ")
    )
}
