//! Consensus merging of per-source readings and forecasts.
//!
//! Iteration over the per-source maps follows `HashMap` order, so the
//! "first" source used for icons and for breaking description ties is
//! arbitrary between runs.

use std::collections::HashMap;

use chrono::Utc;

use crate::model::{ConsensusCurrent, ConsensusForecast, ForecastDay, Reading};

/// Confidence assigned when only one source contributed.
pub const SINGLE_SOURCE_CONFIDENCE: f64 = 0.5;
/// Temperature variance (°C²) treated as total disagreement.
pub const VARIANCE_SCALE: f64 = 25.0;
/// Confidence added per source beyond the first.
pub const SOURCE_BONUS: f64 = 0.1;

/// Merge current readings from several sources into one record.
///
/// Returns `None` only when `readings` is empty.
pub fn merge_current(city: &str, readings: &HashMap<String, Reading>) -> Option<ConsensusCurrent> {
    let first = readings.values().next()?;
    let count = readings.len() as f64;

    let mut temperature = 0.0;
    let mut feels_like = 0.0;
    let mut humidity = 0.0;
    let mut pressure = 0.0;
    let mut wind_speed = 0.0;
    let mut last_updated = first.observation_time;
    let mut sources = Vec::with_capacity(readings.len());

    for (source, r) in readings {
        temperature += r.temperature_c;
        feels_like += r.feels_like_c;
        humidity += r.humidity_pct;
        pressure += r.pressure_hpa;
        wind_speed += r.wind_speed_mps;
        last_updated = last_updated.max(r.observation_time);
        sources.push(source.clone());
    }

    let temps: Vec<f64> = readings.values().map(|r| r.temperature_c).collect();
    let description = most_common(readings.values().map(|r| r.description.as_str()))
        .unwrap_or_default()
        .to_string();

    Some(ConsensusCurrent {
        city: city.to_string(),
        temperature_c: temperature / count,
        feels_like_c: feels_like / count,
        humidity_pct: humidity / count,
        pressure_hpa: pressure / count,
        wind_speed_mps: wind_speed / count,
        description,
        icon: first.icon.clone(),
        confidence: confidence(&temps),
        sources,
        last_updated,
    })
}

/// Merge per-source daily forecasts into a `days`-long consensus forecast.
///
/// Sources with fewer than `days` entries are ignored; `None` if none remain.
pub fn merge_forecast(
    city: &str,
    forecasts: &HashMap<String, Vec<ForecastDay>>,
    days: usize,
) -> Option<ConsensusForecast> {
    if days == 0 {
        return None;
    }

    let (sources, series): (Vec<String>, Vec<&[ForecastDay]>) = forecasts
        .iter()
        .filter(|(_, f)| f.len() >= days)
        .map(|(source, f)| (source.clone(), &f[..days]))
        .unzip();

    if series.is_empty() {
        return None;
    }

    let count = series.len() as f64;
    let merged = (0..days)
        .map(|day| {
            let entries: Vec<&ForecastDay> = series.iter().map(|s| &s[day]).collect();
            let first = entries[0];
            let mean = |field: fn(&ForecastDay) -> f64| entries.iter().map(|e| field(e)).sum::<f64>() / count;

            ForecastDay {
                date: first.date,
                max_temp_c: mean(|e| e.max_temp_c),
                min_temp_c: mean(|e| e.min_temp_c),
                avg_temp_c: mean(|e| e.avg_temp_c),
                humidity_pct: mean(|e| e.humidity_pct),
                precipitation_mm: mean(|e| e.precipitation_mm),
                description: most_common(entries.iter().map(|e| e.description.as_str()))
                    .unwrap_or_default()
                    .to_string(),
                icon: first.icon.clone(),
            }
        })
        .collect();

    Some(ConsensusForecast {
        city: city.to_string(),
        days: merged,
        sources,
        last_updated: Utc::now(),
    })
}

/// Agreement score in `[0, 1]` for a set of contributed temperatures.
pub fn confidence(temperatures: &[f64]) -> f64 {
    if temperatures.len() <= 1 {
        return SINGLE_SOURCE_CONFIDENCE;
    }

    let n = temperatures.len() as f64;
    let mean = temperatures.iter().sum::<f64>() / n;
    let variance = temperatures.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n;

    let normalized = (variance / VARIANCE_SCALE).clamp(0.0, 1.0);
    let bonus = SOURCE_BONUS * (n - 1.0);

    (1.0 - normalized + bonus).clamp(0.0, 1.0)
}

/// Statistical mode; on ties the value seen first wins.
pub(crate) fn most_common<'a>(values: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, n)) => *n += 1,
            None => counts.push((value, 1)),
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (value, n) in counts {
        if best.is_none_or(|(_, top)| n > top) {
            best = Some((value, n));
        }
    }
    best.map(|(value, _)| value)
}
