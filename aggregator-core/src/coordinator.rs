//! Fans refresh cycles out to every source, publishes per-city snapshots and
//! keeps the cache populated with consensus records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::aggregate::{merge_current, merge_forecast};
use crate::cache::WeatherCache;
use crate::config::Config;
use crate::error::AggregatorError;
use crate::model::{ConsensusCurrent, ConsensusForecast, Snapshot, Stats};
use crate::provider::{SourceAdapter, build_sources};

/// Forecast length requested from every source during a cycle.
pub const FORECAST_FETCH_DAYS: usize = 3;
/// Longest forecast that can be requested from the coordinator.
pub const MAX_FORECAST_DAYS: usize = 7;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub cache_ttl: Duration,
    pub cache_max_size: usize,
    /// Deadline for the single-city refresh behind a cache miss.
    pub on_demand_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(600),
            cache_max_size: 1000,
            on_demand_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_ttl: config.cache_ttl(),
            cache_max_size: config.cache.max_size,
            on_demand_timeout: config.on_demand_timeout(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// Per-city outcome of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, AggregatorError)>,
}

impl RefreshReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failure_for(&self, city: &str) -> Option<&AggregatorError> {
        self.failed
            .iter()
            .find(|(c, _)| c == city)
            .map(|(_, err)| err)
    }
}

#[derive(Debug, Default)]
struct Counters {
    last_fetch_time: Option<DateTime<Utc>>,
    success_count: u64,
    failure_count: u64,
}

#[derive(Debug)]
struct Inner {
    sources: Vec<Arc<dyn SourceAdapter>>,
    cache: Arc<WeatherCache>,
    snapshots: RwLock<HashMap<String, Snapshot>>,
    counters: Mutex<Counters>,
    settings: CoordinatorSettings,
}

type CityOutcome = (String, Result<(), AggregatorError>);

/// Shared handle to the aggregation engine. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        sources: Vec<Arc<dyn SourceAdapter>>,
        settings: CoordinatorSettings,
    ) -> Result<Self, AggregatorError> {
        if sources.is_empty() {
            return Err(AggregatorError::NoSources);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                sources,
                cache: Arc::new(WeatherCache::new(settings.cache_max_size)),
                snapshots: RwLock::new(HashMap::new()),
                counters: Mutex::new(Counters::default()),
                settings,
            }),
        })
    }

    /// Build the enabled sources from `config` and wrap them in a coordinator.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let sources = build_sources(config)?;
        Ok(Self::new(sources, CoordinatorSettings::from_config(config))?)
    }

    pub fn sources(&self) -> Vec<String> {
        self.inner
            .sources
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    pub fn cache(&self) -> &Arc<WeatherCache> {
        &self.inner.cache
    }

    /// Latest published snapshot for `city`.
    pub fn snapshot(&self, city: &str) -> Option<Snapshot> {
        self.inner.snapshots.read().get(city).cloned()
    }

    pub fn spawn_cache_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.inner
            .cache
            .spawn_sweeper(self.inner.settings.sweep_interval, cancel)
    }

    /// Refresh every city in `cities` from all sources, without a deadline.
    pub async fn refresh(&self, cities: &[String]) -> RefreshReport {
        self.run_cycle(cities, None).await
    }

    pub async fn refresh_now(&self, cities: &[String]) -> RefreshReport {
        self.refresh(cities).await
    }

    /// Refresh `cities`; whatever is unfinished after `deadline` fails with
    /// [`AggregatorError::DeadlineExceeded`].
    pub async fn refresh_with_deadline(&self, cities: &[String], deadline: Duration) -> RefreshReport {
        self.run_cycle(cities, Some(deadline)).await
    }

    #[instrument(skip_all, fields(cities = cities.len(), deadline = ?deadline))]
    async fn run_cycle(&self, cities: &[String], deadline: Option<Duration>) -> RefreshReport {
        let started = Instant::now();
        self.inner.counters.lock().last_fetch_time = Some(Utc::now());

        let cancel = CancellationToken::new();
        let mut pending: Vec<String> = Vec::new();
        let mut tasks = JoinSet::new();

        for city in cities {
            if pending.contains(city) {
                continue;
            }
            pending.push(city.clone());

            let this = self.clone();
            let city = city.clone();
            let cancel = cancel.clone();
            tasks.spawn(
                async move {
                    let outcome = this.refresh_city(&city, &cancel).await;
                    (city, outcome)
                }
                .in_current_span(),
            );
        }

        let deadline_at = deadline.map(|d| started + d);
        let mut report = RefreshReport::default();
        let mut timed_out = false;

        loop {
            let joined = match deadline_at {
                Some(at) => match tokio::time::timeout_at(at, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                },
                None => tasks.join_next().await,
            };
            let Some(joined) = joined else {
                break;
            };
            self.record(joined, &mut pending, &mut report);
        }

        if timed_out {
            warn!(unfinished = pending.len(), "refresh deadline reached, cancelling");
            cancel.cancel();
            tasks.abort_all();
            // Tasks that finished before the abort still count.
            while let Some(joined) = tasks.join_next().await {
                self.record(joined, &mut pending, &mut report);
            }
        }

        for city in pending {
            let err = if timed_out {
                AggregatorError::DeadlineExceeded(city.clone())
            } else {
                AggregatorError::AllSourcesFailed(city.clone())
            };
            error!(city = %city, error = %err, "city refresh failed");
            self.inner.counters.lock().failure_count += 1;
            report.failed.push((city, err));
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            elapsed = ?started.elapsed(),
            "refresh cycle completed"
        );
        report
    }

    fn record(
        &self,
        joined: Result<CityOutcome, JoinError>,
        pending: &mut Vec<String>,
        report: &mut RefreshReport,
    ) {
        let (city, outcome) = match joined {
            Ok(done) => done,
            Err(err) => {
                if !err.is_cancelled() {
                    error!(error = %err, "city refresh task panicked");
                }
                return;
            }
        };
        pending.retain(|c| *c != city);

        match outcome {
            Ok(()) => {
                self.inner.counters.lock().success_count += 1;
                report.succeeded.push(city);
            }
            Err(err) => {
                self.inner.counters.lock().failure_count += 1;
                error!(city = %city, error = %err, "city refresh failed");
                report.failed.push((city, err));
            }
        }
    }

    async fn refresh_city(&self, city: &str, cancel: &CancellationToken) -> Result<(), AggregatorError> {
        let mut fetches = JoinSet::new();

        for source in &self.inner.sources {
            let source = Arc::clone(source);
            let city = city.to_string();
            let cancel = cancel.clone();
            fetches.spawn(
                async move {
                    let (current, forecast) = tokio::join!(
                        source.fetch_current(&city, &cancel),
                        source.fetch_forecast(&city, FORECAST_FETCH_DAYS, &cancel),
                    );
                    (source.id().to_string(), current, forecast)
                }
                .in_current_span(),
            );
        }

        let mut snapshot = Snapshot::new(city);
        while let Some(joined) = fetches.join_next().await {
            let (source, current, forecast) = match joined {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(city, error = %err, "source task failed");
                    continue;
                }
            };

            match current {
                Ok(reading) => {
                    snapshot.current.insert(source.clone(), reading);
                }
                Err(err) => warn!(city, source = %source, error = %err, "current weather fetch failed"),
            }
            match forecast {
                Ok(days) => {
                    snapshot.forecasts.insert(source, days);
                }
                Err(err) => warn!(city, source = %source, error = %err, "forecast fetch failed"),
            }
        }

        if !snapshot.is_publishable() {
            return Err(AggregatorError::AllSourcesFailed(city.to_string()));
        }
        self.publish(snapshot);
        Ok(())
    }

    /// Cache the consensus derived from `snapshot`, then make it the city's latest.
    fn publish(&self, snapshot: Snapshot) {
        let city = snapshot.city.clone();
        let ttl = self.inner.settings.cache_ttl;

        if let Some(current) = merge_current(&city, &snapshot.current) {
            self.inner.cache.put_current(&city, current, ttl);
        }
        for days in 1..=MAX_FORECAST_DAYS {
            match merge_forecast(&city, &snapshot.forecasts, days) {
                Some(forecast) => self.inner.cache.put_forecast(&city, days, forecast, ttl),
                None => {
                    // An older cycle may have cached this length; it no longer holds.
                    if self.inner.cache.remove_forecast(&city, days) {
                        debug!(city = %city, days, "dropped forecast the new snapshot cannot support");
                    }
                }
            }
        }

        info!(city = %city, sources = snapshot.current.len(), "city refreshed");
        self.inner.snapshots.write().insert(city, snapshot);
    }

    /// Current consensus for `city`, from cache or a bounded on-demand refresh.
    #[instrument(skip(self))]
    pub async fn get_current(&self, city: &str) -> Result<ConsensusCurrent, AggregatorError> {
        if let Some(hit) = self.inner.cache.get_current(city) {
            debug!("cache hit");
            return Ok(hit);
        }

        debug!("cache miss, refreshing");
        let report = self.refresh_on_demand(city).await;
        self.inner
            .cache
            .get_current(city)
            .ok_or_else(|| miss_error(city, &report))
    }

    /// Consensus forecast of `days` days (1..=7) for `city`.
    #[instrument(skip(self))]
    pub async fn get_forecast(
        &self,
        city: &str,
        days: usize,
    ) -> Result<ConsensusForecast, AggregatorError> {
        if !(1..=MAX_FORECAST_DAYS).contains(&days) {
            return Err(AggregatorError::InvalidDays {
                got: days,
                max: MAX_FORECAST_DAYS,
            });
        }

        if let Some(hit) = self.inner.cache.get_forecast(city, days) {
            debug!("cache hit");
            return Ok(hit);
        }

        debug!("cache miss, refreshing");
        let report = self.refresh_on_demand(city).await;
        self.inner
            .cache
            .get_forecast(city, days)
            .ok_or_else(|| miss_error(city, &report))
    }

    async fn refresh_on_demand(&self, city: &str) -> RefreshReport {
        self.refresh_with_deadline(&[city.to_string()], self.inner.settings.on_demand_timeout)
            .await
    }

    pub fn stats(&self) -> Stats {
        let counters = self.inner.counters.lock();
        Stats {
            last_fetch_time: counters.last_fetch_time,
            success_count: counters.success_count,
            failure_count: counters.failure_count,
            cities_tracked: self.inner.snapshots.read().len(),
            active_sources: self.inner.sources.len(),
            cache: self.inner.cache.stats(),
        }
    }
}

fn miss_error(city: &str, report: &RefreshReport) -> AggregatorError {
    match report.failure_for(city) {
        Some(err @ AggregatorError::AllSourcesFailed(_)) => err.clone(),
        _ => AggregatorError::NotAvailable(city.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::test_support::{FakeCity, FakeSource, forecast_day, reading, shared};

    fn coordinator(sources: &[&Arc<FakeSource>]) -> Coordinator {
        coordinator_with(sources, CoordinatorSettings::default())
    }

    fn coordinator_with(sources: &[&Arc<FakeSource>], settings: CoordinatorSettings) -> Coordinator {
        let sources = sources
            .iter()
            .map(|s| Arc::clone(*s) as Arc<dyn SourceAdapter>)
            .collect();
        Coordinator::new(sources, settings).unwrap()
    }

    fn cities(names: &[&str]) -> Vec<String> {
        names.iter().map(|c| c.to_string()).collect()
    }

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn requires_at_least_one_source() {
        let err = Coordinator::new(Vec::new(), CoordinatorSettings::default()).unwrap_err();
        assert_eq!(err, AggregatorError::NoSources);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_still_publishes() {
        let a = shared(FakeSource::new("a").with_city("Prague", 10.0, "clear"));
        let b = shared(FakeSource::new("b").failing_for("Prague"));
        let c = shared(FakeSource::new("c"));
        let coord = coordinator(&[&a, &b, &c]);

        let report = coord.refresh(&cities(&["Prague"])).await;
        assert!(report.is_success());
        assert_eq!(report.succeeded, vec!["Prague"]);

        let current = coord.get_current("Prague").await.unwrap();
        assert_eq!(current.sources, vec!["a"]);
        assert_eq!(current.temperature_c, 10.0);
        assert_eq!(current.confidence, 0.5);
        assert_eq!(a.current_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_sources_failing_fails_city_once() {
        let a = shared(FakeSource::new("a").failing_for("Prague"));
        let b = shared(FakeSource::new("b").failing_for("Prague"));
        let coord = coordinator(&[&a, &b]);

        let report = coord.refresh(&cities(&["Prague"])).await;
        assert_eq!(
            report.failed,
            vec![(
                "Prague".to_string(),
                AggregatorError::AllSourcesFailed("Prague".into())
            )]
        );
        assert!(report.succeeded.is_empty());
        assert!(coord.snapshot("Prague").is_none());

        let stats = coord.stats();
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.success_count, 0);

        let err = coord.get_current("Prague").await.unwrap_err();
        assert_eq!(err, AggregatorError::AllSourcesFailed("Prague".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn sibling_calls_survive_a_failing_forecast() {
        let a = shared(FakeSource::new("a").with_city("Prague", 10.0, "clear"));
        let b = shared(FakeSource::new("b").with_answer(
            "Prague",
            FakeCity {
                current: Ok(reading("b", "Prague", 14.0, "clear")),
                forecast: Err(FetchError::ServerError(503)),
            },
        ));
        let coord = coordinator(&[&a, &b]);

        coord.refresh(&cities(&["Prague"])).await;

        let current = coord.get_current("Prague").await.unwrap();
        assert_eq!(sorted(current.sources), vec!["a", "b"]);
        assert_eq!(current.temperature_c, 12.0);

        let forecast = coord.get_forecast("Prague", 3).await.unwrap();
        assert_eq!(forecast.sources, vec!["a"]);

        let snapshot = coord.snapshot("Prague").unwrap();
        assert_eq!(snapshot.current.len(), 2);
        assert_eq!(snapshot.forecasts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_only_unfinished_cities() {
        let a = shared(
            FakeSource::new("a")
                .with_city("Prague", 10.0, "clear")
                .with_city("Tokyo", 20.0, "rain")
                .with_delay_for("Tokyo", Duration::from_secs(10)),
        );
        let coord = coordinator(&[&a]);
        let started = Instant::now();

        let report = coord
            .refresh_with_deadline(&cities(&["Prague", "Tokyo"]), Duration::from_secs(1))
            .await;

        assert_eq!(Instant::now() - started, Duration::from_secs(1));
        assert_eq!(report.succeeded, vec!["Prague"]);
        assert_eq!(
            report.failed,
            vec![(
                "Tokyo".to_string(),
                AggregatorError::DeadlineExceeded("Tokyo".into())
            )]
        );
        assert!(coord.cache().get_current("Prague").is_some());
        assert!(coord.cache().get_current("Tokyo").is_none());

        let stats = coord.stats();
        assert_eq!((stats.success_count, stats.failure_count), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_refresh_is_bounded() {
        let a = shared(
            FakeSource::new("a")
                .with_city("Tokyo", 20.0, "rain")
                .with_delay(Duration::from_secs(120)),
        );
        let coord = coordinator_with(
            &[&a],
            CoordinatorSettings {
                on_demand_timeout: Duration::from_secs(30),
                ..CoordinatorSettings::default()
            },
        );
        let started = Instant::now();

        let err = coord.get_current("Tokyo").await.unwrap_err();
        assert_eq!(err, AggregatorError::NotAvailable("Tokyo".into()));
        assert_eq!(Instant::now() - started, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn reads_are_served_from_cache() {
        let a = shared(FakeSource::new("a").with_city("Prague", 10.0, "clear"));
        let coord = coordinator(&[&a]);

        let first = coord.get_current("Prague").await.unwrap();
        let second = coord.get_current("Prague").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(a.current_calls(), 1);

        coord.get_forecast("Prague", 2).await.unwrap();
        assert_eq!(a.forecast_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_trigger_refetch() {
        let a = shared(FakeSource::new("a").with_city("Prague", 10.0, "clear"));
        let coord = coordinator_with(
            &[&a],
            CoordinatorSettings {
                cache_ttl: Duration::from_secs(60),
                ..CoordinatorSettings::default()
            },
        );

        coord.get_current("Prague").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        coord.get_current("Prague").await.unwrap();

        assert_eq!(a.current_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn forecasts_cached_only_for_satisfiable_lengths() {
        let a = shared(FakeSource::new("a").with_city("Prague", 10.0, "clear"));
        let b = shared(FakeSource::new("b").with_city("Prague", 12.0, "clear"));
        let coord = coordinator(&[&a, &b]);

        coord.refresh(&cities(&["Prague"])).await;

        for days in 1..=FORECAST_FETCH_DAYS {
            let forecast = coord.cache().get_forecast("Prague", days).unwrap();
            assert_eq!(forecast.days.len(), days);
            assert_eq!(forecast.days[0].max_temp_c, 16.0);
        }
        for days in FORECAST_FETCH_DAYS + 1..=MAX_FORECAST_DAYS {
            assert!(coord.cache().get_forecast("Prague", days).is_none());
        }

        let err = coord.get_forecast("Prague", 5).await.unwrap_err();
        assert_eq!(err, AggregatorError::NotAvailable("Prague".into()));
        assert_eq!(a.forecast_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_forecast_evicts_longer_cached_lengths() {
        let a = shared(FakeSource::new("a").with_city("Prague", 10.0, "clear"));
        let coord = coordinator(&[&a]);

        coord.refresh(&cities(&["Prague"])).await;
        assert!(coord.cache().get_forecast("Prague", 3).is_some());

        a.set_answer(
            "Prague",
            FakeCity {
                current: Ok(reading("a", "Prague", 11.0, "clear")),
                forecast: Ok(vec![forecast_day(18, 14.0, 6.0, "clear")]),
            },
        );
        coord.refresh(&cities(&["Prague"])).await;

        assert_eq!(coord.cache().get_forecast("Prague", 1).unwrap().days[0].max_temp_c, 14.0);
        assert!(coord.cache().get_forecast("Prague", 2).is_none());
        assert!(coord.cache().get_forecast("Prague", 3).is_none());
        assert_eq!(coord.stats().cache.forecast_items, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_day_counts_are_rejected_without_fetching() {
        let a = shared(FakeSource::new("a").with_city("Prague", 10.0, "clear"));
        let coord = coordinator(&[&a]);

        for days in [0, 8] {
            let err = coord.get_forecast("Prague", days).await.unwrap_err();
            assert_eq!(err, AggregatorError::InvalidDays { got: days, max: 7 });
        }
        assert_eq!(a.current_calls(), 0);
        assert_eq!(a.forecast_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_track_cycles() {
        let a = shared(
            FakeSource::new("a")
                .with_city("Prague", 10.0, "clear")
                .with_city("London", 8.0, "rain"),
        );
        let coord = coordinator(&[&a]);
        assert!(coord.stats().last_fetch_time.is_none());

        let report = coord
            .refresh_now(&cities(&["Prague", "London", "Prague"]))
            .await;
        assert_eq!(sorted(report.succeeded), vec!["London", "Prague"]);
        assert_eq!(a.current_calls(), 2);

        let stats = coord.stats();
        assert!(stats.last_fetch_time.is_some());
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.cities_tracked, 2);
        assert_eq!(stats.active_sources, 1);
        assert_eq!(stats.cache.current_items, 2);
        assert_eq!(stats.cache.forecast_items, 6);
        assert_eq!(coord.sources(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn last_fetch_time_is_stamped_when_a_cycle_starts() {
        let a = shared(
            FakeSource::new("a")
                .with_city("Prague", 10.0, "clear")
                .with_delay(Duration::from_secs(20)),
        );
        let coord = coordinator(&[&a]);

        let running = tokio::spawn({
            let coord = coord.clone();
            async move { coord.refresh(&cities(&["Prague"])).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stats = coord.stats();
        assert!(stats.last_fetch_time.is_some());
        assert_eq!(stats.success_count, 0);

        assert!(running.await.unwrap().is_success());
        assert_eq!(coord.stats().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_replaced_on_next_cycle() {
        let a = shared(FakeSource::new("a").with_answer(
            "Prague",
            FakeCity {
                current: Ok(reading("a", "Prague", 10.0, "clear")),
                forecast: Ok(vec![forecast_day(18, 15.0, 5.0, "clear")]),
            },
        ));
        let coord = coordinator(&[&a]);

        coord.refresh(&cities(&["Prague"])).await;
        let first = coord.snapshot("Prague").unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        coord.refresh(&cities(&["Prague"])).await;
        let second = coord.snapshot("Prague").unwrap();

        assert!(second.captured_at >= first.captured_at);
        assert_eq!(coord.stats().cities_tracked, 1);
        assert_eq!(second.forecasts["a"].len(), 1);
    }
}
