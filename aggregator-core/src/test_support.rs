//! Fakes shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::fetcher::{HttpResponse, HttpTransport};
use crate::model::{ForecastDay, Reading};
use crate::provider::SourceAdapter;

/// Transport that replays a script of responses, then an optional fallback.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, FetchError>>>,
    fallback: Option<HttpResponse>,
    urls: Mutex<Vec<String>>,
    times: Mutex<Vec<Instant>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<HttpResponse, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn repeating(response: HttpResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Self::default()
        }
    }

    pub fn push(&self, response: Result<HttpResponse, FetchError>) {
        self.script.lock().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.times.lock().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.times.lock().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
        self.urls.lock().push(url.to_string());
        self.times.lock().push(Instant::now());

        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        match &self.fallback {
            Some(res) => Ok(res.clone()),
            None => Err(FetchError::Transport("script exhausted".into())),
        }
    }
}

pub fn reading(source: &str, city: &str, temperature_c: f64, description: &str) -> Reading {
    Reading {
        source: source.to_string(),
        city: city.to_string(),
        temperature_c,
        feels_like_c: temperature_c - 1.0,
        humidity_pct: 60.0,
        pressure_hpa: 1013.0,
        wind_speed_mps: 3.0,
        wind_direction_deg: 180.0,
        description: description.to_string(),
        icon: format!("{source}-icon"),
        observation_time: Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap(),
    }
}

pub fn forecast_day(day: u32, max: f64, min: f64, description: &str) -> ForecastDay {
    ForecastDay {
        date: NaiveDate::from_ymd_opt(2026, 10, day).unwrap(),
        max_temp_c: max,
        min_temp_c: min,
        avg_temp_c: (max + min) / 2.0,
        humidity_pct: 70.0,
        precipitation_mm: 1.0,
        description: description.to_string(),
        icon: "10d".to_string(),
    }
}

/// What a [`FakeSource`] answers for one city.
#[derive(Debug, Clone)]
pub struct FakeCity {
    pub current: Result<Reading, FetchError>,
    pub forecast: Result<Vec<ForecastDay>, FetchError>,
}

/// In-memory adapter with per-city canned answers and an optional delay.
#[derive(Debug, Default)]
pub struct FakeSource {
    id: String,
    cities: Mutex<HashMap<String, FakeCity>>,
    delay: Option<Duration>,
    city_delays: HashMap<String, Duration>,
    current_calls: AtomicUsize,
    forecast_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    /// Answer for `city` with a reading at `temperature_c` and a 3-day forecast.
    pub fn with_city(mut self, city: &str, temperature_c: f64, description: &str) -> Self {
        let days = (1..=3)
            .map(|d| forecast_day(d, temperature_c + 5.0, temperature_c - 5.0, description))
            .collect();
        let current = Ok(reading(&self.id, city, temperature_c, description));
        self.cities.get_mut().insert(
            city.to_string(),
            FakeCity {
                current,
                forecast: Ok(days),
            },
        );
        self
    }

    pub fn with_answer(mut self, city: &str, answer: FakeCity) -> Self {
        self.cities.get_mut().insert(city.to_string(), answer);
        self
    }

    /// Change the answer for `city` between cycles.
    pub fn set_answer(&self, city: &str, answer: FakeCity) {
        self.cities.lock().insert(city.to_string(), answer);
    }

    pub fn failing_for(self, city: &str) -> Self {
        self.with_answer(
            city,
            FakeCity {
                current: Err(FetchError::ServerError(500)),
                forecast: Err(FetchError::ServerError(500)),
            },
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay answers for `city` only.
    pub fn with_delay_for(mut self, city: &str, delay: Duration) -> Self {
        self.city_delays.insert(city.to_string(), delay);
        self
    }

    pub fn current_calls(&self) -> usize {
        self.current_calls.load(Ordering::SeqCst)
    }

    pub fn forecast_calls(&self) -> usize {
        self.forecast_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self, city: &str, cancel: &CancellationToken) -> Result<(), FetchError> {
        if let Some(delay) = self.city_delays.get(city).copied().or(self.delay) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    fn answer(&self, city: &str) -> Result<FakeCity, FetchError> {
        self.cities
            .lock()
            .get(city)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(city.to_string()))
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_current(
        &self,
        city: &str,
        cancel: &CancellationToken,
    ) -> Result<Reading, FetchError> {
        self.current_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(city, cancel).await?;
        self.answer(city)?.current
    }

    async fn fetch_forecast(
        &self,
        city: &str,
        days: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ForecastDay>, FetchError> {
        self.forecast_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(city, cancel).await?;
        let forecast = self.answer(city)?.forecast?;
        Ok(forecast.into_iter().take(days).collect())
    }
}

pub fn shared(source: FakeSource) -> Arc<FakeSource> {
    Arc::new(source)
}
