use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One provider's current-weather observation for a city.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub source: String,
    pub city: String,
    pub temperature_c: f64,
    pub feels_like_c: f64,
    pub humidity_pct: f64,
    pub pressure_hpa: f64,
    pub wind_speed_mps: f64,
    pub wind_direction_deg: f64,
    pub description: String,
    pub icon: String,
    pub observation_time: DateTime<Utc>,
}

/// One day of a provider's forecast. Also used for merged forecast days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDay {
    pub date: NaiveDate,
    pub max_temp_c: f64,
    pub min_temp_c: f64,
    pub avg_temp_c: f64,
    pub humidity_pct: f64,
    pub precipitation_mm: f64,
    pub description: String,
    pub icon: String,
}

/// Everything collected for one city during one refresh cycle.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub city: String,
    pub current: HashMap<String, Reading>,
    pub forecasts: HashMap<String, Vec<ForecastDay>>,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(city: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            current: HashMap::new(),
            forecasts: HashMap::new(),
            captured_at: Utc::now(),
        }
    }

    /// A snapshot is publishable once at least one source delivered current weather.
    pub fn is_publishable(&self) -> bool {
        !self.current.is_empty()
    }
}

/// Cross-provider merged current weather.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusCurrent {
    pub city: String,
    pub temperature_c: f64,
    pub feels_like_c: f64,
    pub humidity_pct: f64,
    pub pressure_hpa: f64,
    pub wind_speed_mps: f64,
    pub description: String,
    pub icon: String,
    pub confidence: f64,
    pub sources: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// Cross-provider merged forecast for a fixed number of days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusForecast {
    pub city: String,
    pub days: Vec<ForecastDay>,
    pub sources: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// Occupancy figures reported by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub current_items: usize,
    pub forecast_items: usize,
    pub max_size: usize,
}

impl CacheStats {
    pub fn occupancy(&self) -> usize {
        self.current_items + self.forecast_items
    }
}

/// Process-lifetime counters exposed to the service layer.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    /// When the most recent refresh cycle started, finished or not.
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
    pub cities_tracked: usize,
    pub active_sources: usize,
    pub cache: CacheStats,
}
