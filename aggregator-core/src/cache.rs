//! TTL- and capacity-bounded store of consensus records.
//!
//! Two key spaces share one capacity budget: current weather keyed by city and
//! forecasts keyed by `(city, days)`. Reads check expiry themselves, so the
//! background sweep only reclaims memory early.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::{CacheStats, ConsensusCurrent, ConsensusForecast};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub payload: T,
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Current(String),
    Forecast(String, usize),
}

#[derive(Debug, Default)]
struct Stores {
    current: HashMap<String, CacheEntry<ConsensusCurrent>>,
    forecast: HashMap<(String, usize), CacheEntry<ConsensusForecast>>,
}

impl Stores {
    fn len(&self) -> usize {
        self.current.len() + self.forecast.len()
    }

    fn contains(&self, key: &CacheKey) -> bool {
        match key {
            CacheKey::Current(city) => self.current.contains_key(city),
            CacheKey::Forecast(city, days) => self.forecast.contains_key(&(city.clone(), *days)),
        }
    }

    fn earliest_expiry(&self) -> Option<CacheKey> {
        let current = self
            .current
            .iter()
            .map(|(city, e)| (e.expires_at, CacheKey::Current(city.clone())));
        let forecast = self
            .forecast
            .iter()
            .map(|((city, days), e)| (e.expires_at, CacheKey::Forecast(city.clone(), *days)));

        current
            .chain(forecast)
            .min_by_key(|(expires_at, _)| *expires_at)
            .map(|(_, key)| key)
    }

    fn remove(&mut self, key: &CacheKey) {
        match key {
            CacheKey::Current(city) => {
                self.current.remove(city);
            }
            CacheKey::Forecast(city, days) => {
                self.forecast.remove(&(city.clone(), *days));
            }
        }
    }

    /// Make room for `key` unless it replaces an existing entry.
    fn reserve(&mut self, key: &CacheKey, max_size: usize) {
        if self.contains(key) {
            return;
        }
        while self.len() >= max_size {
            let Some(victim) = self.earliest_expiry() else {
                break;
            };
            debug!(?victim, "evicting entry with earliest expiry");
            self.remove(&victim);
        }
    }
}

#[derive(Debug)]
pub struct WeatherCache {
    stores: RwLock<Stores>,
    max_size: usize,
}

impl WeatherCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            stores: RwLock::new(Stores::default()),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn put_current(&self, city: &str, payload: ConsensusCurrent, ttl: Duration) {
        if self.max_size == 0 {
            return;
        }
        let key = CacheKey::Current(city.to_string());
        let expires_at = Instant::now() + ttl;

        let mut stores = self.stores.write();
        stores.reserve(&key, self.max_size);
        stores
            .current
            .insert(city.to_string(), CacheEntry { payload, expires_at });
        debug!(city, ?ttl, "current weather cached");
    }

    pub fn put_forecast(&self, city: &str, days: usize, payload: ConsensusForecast, ttl: Duration) {
        if self.max_size == 0 {
            return;
        }
        let key = CacheKey::Forecast(city.to_string(), days);
        let expires_at = Instant::now() + ttl;

        let mut stores = self.stores.write();
        stores.reserve(&key, self.max_size);
        stores
            .forecast
            .insert((city.to_string(), days), CacheEntry { payload, expires_at });
        debug!(city, days, ?ttl, "forecast cached");
    }

    /// Drop the `(city, days)` forecast, if cached.
    pub fn remove_forecast(&self, city: &str, days: usize) -> bool {
        self.stores
            .write()
            .forecast
            .remove(&(city.to_string(), days))
            .is_some()
    }

    pub fn get_current(&self, city: &str) -> Option<ConsensusCurrent> {
        let now = Instant::now();
        {
            let stores = self.stores.read();
            let entry = stores.current.get(city)?;
            if !entry.is_expired(now) {
                return Some(entry.payload.clone());
            }
        }

        let mut stores = self.stores.write();
        // Re-check: a writer may have refreshed the entry in between.
        if stores.current.get(city).is_some_and(|e| e.is_expired(now)) {
            stores.current.remove(city);
            debug!(city, "expired current weather evicted on read");
        }
        None
    }

    pub fn get_forecast(&self, city: &str, days: usize) -> Option<ConsensusForecast> {
        let now = Instant::now();
        let key = (city.to_string(), days);
        {
            let stores = self.stores.read();
            let entry = stores.forecast.get(&key)?;
            if !entry.is_expired(now) {
                return Some(entry.payload.clone());
            }
        }

        let mut stores = self.stores.write();
        if stores.forecast.get(&key).is_some_and(|e| e.is_expired(now)) {
            stores.forecast.remove(&key);
            debug!(city, days, "expired forecast evicted on read");
        }
        None
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut stores = self.stores.write();
        let before = stores.len();

        stores.current.retain(|_, e| !e.is_expired(now));
        stores.forecast.retain(|_, e| !e.is_expired(now));

        let removed = before - stores.len();
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        // `interval_at` panics on a zero period.
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                }
            }
            debug!("cache sweeper stopped");
        })
    }

    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let stores = self.stores.read();
        CacheStats {
            current_items: stores.current.len(),
            forecast_items: stores.forecast.len(),
            max_size: self.max_size,
        }
    }
}
