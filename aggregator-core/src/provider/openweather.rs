use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Url;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::most_common,
    error::FetchError,
    fetcher::ResilientFetcher,
    model::{ForecastDay, Reading},
};

use super::{ProviderId, SourceAdapter};

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org/data/2.5";

/// 3-hour steps per day in the forecast endpoint.
const ENTRIES_PER_DAY: usize = 8;

#[derive(Debug)]
pub struct OpenWeatherSource {
    api_key: String,
    base_url: String,
    fetcher: ResilientFetcher,
}

impl OpenWeatherSource {
    pub fn new(api_key: String, fetcher: ResilientFetcher) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            fetcher,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, endpoint: &str, city: &str, extra: &[(&str, String)]) -> Result<Url, FetchError> {
        let mut params = vec![
            ("q", city.to_string()),
            ("appid", self.api_key.clone()),
            ("units", "metric".to_string()),
        ];
        params.extend(extra.iter().map(|(k, v)| (*k, v.clone())));

        Url::parse_with_params(&format!("{}/{endpoint}", self.base_url), &params)
            .map_err(|e| FetchError::Transport(format!("invalid OpenWeather URL: {e}")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OwCod {
    Number(i64),
    Text(String),
}

impl OwCod {
    fn code(&self) -> String {
        match self {
            OwCod::Number(n) => n.to_string(),
            OwCod::Text(s) => s.clone(),
        }
    }
}

fn check_cod(cod: Option<&OwCod>) -> Result<(), FetchError> {
    match cod.map(OwCod::code) {
        Some(code) if code != "200" => Err(FetchError::Parse(format!(
            "OpenWeather reported error code {code}"
        ))),
        _ => Ok(()),
    }
}

// The API answers 404 for cities it cannot resolve.
fn city_not_found(city: &str) -> impl FnOnce(FetchError) -> FetchError + '_ {
    move |err| match err {
        FetchError::ClientRejected(404) => FetchError::NotFound(city.to_string()),
        other => other,
    }
}

#[derive(Debug, Deserialize)]
struct OwMain {
    temp: f64,
    #[serde(default)]
    feels_like: Option<f64>,
    #[serde(default)]
    pressure: f64,
    #[serde(default)]
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    description: String,
    icon: String,
}

#[derive(Debug, Default, Deserialize)]
struct OwWind {
    #[serde(default)]
    speed: f64,
    #[serde(default)]
    deg: f64,
}

#[derive(Debug, Default, Deserialize)]
struct OwPrecip {
    #[serde(rename = "3h", default)]
    three_hours: f64,
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    #[serde(default)]
    cod: Option<OwCod>,
    dt: i64,
    main: OwMain,
    #[serde(default)]
    weather: Vec<OwWeather>,
    #[serde(default)]
    wind: OwWind,
}

#[derive(Debug, Deserialize)]
struct OwForecastEntry {
    dt: i64,
    main: OwMain,
    #[serde(default)]
    weather: Vec<OwWeather>,
    #[serde(default)]
    rain: Option<OwPrecip>,
    #[serde(default)]
    snow: Option<OwPrecip>,
}

#[derive(Debug, Deserialize)]
struct OwForecastResponse {
    #[serde(default)]
    cod: Option<OwCod>,
    list: Vec<OwForecastEntry>,
}

#[async_trait]
impl SourceAdapter for OpenWeatherSource {
    fn id(&self) -> &str {
        ProviderId::OpenWeather.as_str()
    }

    async fn fetch_current(
        &self,
        city: &str,
        cancel: &CancellationToken,
    ) -> Result<Reading, FetchError> {
        let url = self.url("weather", city, &[])?;
        let body = self
            .fetcher
            .fetch(url.as_str(), cancel)
            .await
            .map_err(city_not_found(city))?;
        parse_current(city, &body)
    }

    async fn fetch_forecast(
        &self,
        city: &str,
        days: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ForecastDay>, FetchError> {
        let url = self.url("forecast", city, &[("cnt", (days * ENTRIES_PER_DAY).to_string())])?;
        let body = self
            .fetcher
            .fetch(url.as_str(), cancel)
            .await
            .map_err(city_not_found(city))?;
        parse_forecast(&body, days)
    }
}

fn parse_current(city: &str, body: &[u8]) -> Result<Reading, FetchError> {
    let parsed: OwCurrentResponse = serde_json::from_slice(body)?;
    check_cod(parsed.cod.as_ref())?;

    let weather = parsed
        .weather
        .first()
        .ok_or_else(|| FetchError::Parse("OpenWeather response has no weather element".into()))?;

    Ok(Reading {
        source: ProviderId::OpenWeather.as_str().to_string(),
        city: city.to_string(),
        temperature_c: parsed.main.temp,
        feels_like_c: parsed.main.feels_like.unwrap_or(parsed.main.temp),
        humidity_pct: parsed.main.humidity,
        pressure_hpa: parsed.main.pressure,
        wind_speed_mps: parsed.wind.speed,
        wind_direction_deg: parsed.wind.deg,
        description: weather.description.clone(),
        icon: weather.icon.clone(),
        observation_time: unix_to_utc(parsed.dt)?,
    })
}

fn parse_forecast(body: &[u8], days: usize) -> Result<Vec<ForecastDay>, FetchError> {
    let parsed: OwForecastResponse = serde_json::from_slice(body)?;
    check_cod(parsed.cod.as_ref())?;

    let mut by_date: BTreeMap<NaiveDate, Vec<&OwForecastEntry>> = BTreeMap::new();
    for entry in &parsed.list {
        let date = unix_to_utc(entry.dt)?.date_naive();
        by_date.entry(date).or_default().push(entry);
    }

    Ok(by_date
        .into_iter()
        .take(days)
        .map(|(date, entries)| summarize_day(date, &entries))
        .collect())
}

fn summarize_day(date: NaiveDate, entries: &[&OwForecastEntry]) -> ForecastDay {
    let count = entries.len() as f64;
    let temps = entries.iter().map(|e| e.main.temp);

    let max_temp_c = temps.clone().fold(f64::NEG_INFINITY, f64::max);
    let min_temp_c = temps.clone().fold(f64::INFINITY, f64::min);
    let avg_temp_c = temps.sum::<f64>() / count;
    let humidity_pct = entries.iter().map(|e| e.main.humidity).sum::<f64>() / count;
    let precipitation_mm = entries
        .iter()
        .map(|e| {
            e.rain.as_ref().map_or(0.0, |p| p.three_hours)
                + e.snow.as_ref().map_or(0.0, |p| p.three_hours)
        })
        .sum();

    let conditions: Vec<&OwWeather> = entries.iter().filter_map(|e| e.weather.first()).collect();
    let description = most_common(conditions.iter().map(|w| w.description.as_str()))
        .unwrap_or("Unknown")
        .to_string();
    let icon = conditions
        .iter()
        .find(|w| w.description == description)
        .map(|w| w.icon.clone())
        .unwrap_or_default();

    ForecastDay {
        date,
        max_temp_c,
        min_temp_c,
        avg_temp_c,
        humidity_pct,
        precipitation_mm,
        description,
        icon,
    }
}

fn unix_to_utc(ts: i64) -> Result<DateTime<Utc>, FetchError> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| FetchError::Parse(format!("timestamp out of range: {ts}")))
}
