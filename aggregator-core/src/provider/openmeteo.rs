use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    error::FetchError,
    fetcher::ResilientFetcher,
    model::{ForecastDay, Reading},
};

use super::{ProviderId, SourceAdapter};

pub const DEFAULT_BASE_URL: &str = "https://api.open-meteo.com/v1";

/// Cities this source can resolve, as (name, latitude, longitude).
const CITY_COORDINATES: &[(&str, f64, f64)] = &[
    ("Prague", 50.0755, 14.4378),
    ("London", 51.5074, -0.1278),
    ("NewYork", 40.7128, -74.0060),
    ("Tokyo", 35.6762, 139.6503),
    ("Sydney", -33.8688, 151.2093),
    ("Berlin", 52.5200, 13.4050),
    ("Paris", 48.8566, 2.3522),
];

const CURRENT_FIELDS: &str = "temperature_2m,apparent_temperature,relative_humidity_2m,\
pressure_msl,wind_speed_10m,wind_direction_10m,weather_code";

const DAILY_FIELDS: &str = "temperature_2m_max,temperature_2m_min,precipitation_sum,\
relative_humidity_2m_mean,weather_code";

/// Look up coordinates; case-insensitive, spaces ignored ("new york" == "NewYork").
pub fn coordinates(city: &str) -> Option<(f64, f64)> {
    let wanted: String = city
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    CITY_COORDINATES
        .iter()
        .find(|(name, _, _)| name.to_lowercase() == wanted)
        .map(|&(_, lat, lon)| (lat, lon))
}

#[derive(Debug)]
pub struct OpenMeteoSource {
    base_url: String,
    fetcher: ResilientFetcher,
}

impl OpenMeteoSource {
    pub fn new(fetcher: ResilientFetcher) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            fetcher,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, city: &str, extra: &[(&str, String)]) -> Result<Url, FetchError> {
        let (lat, lon) = coordinates(city).ok_or_else(|| FetchError::NotFound(city.to_string()))?;

        let mut params = vec![
            ("latitude", lat.to_string()),
            ("longitude", lon.to_string()),
            ("timezone", "UTC".to_string()),
            // Default is km/h; readings carry m/s like OpenWeather's metric units.
            ("wind_speed_unit", "ms".to_string()),
        ];
        params.extend(extra.iter().map(|(k, v)| (*k, v.clone())));

        Url::parse_with_params(&format!("{}/forecast", self.base_url), &params)
            .map_err(|e| FetchError::Transport(format!("invalid Open-Meteo URL: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct OmCurrent {
    time: String,
    temperature_2m: f64,
    #[serde(default)]
    apparent_temperature: Option<f64>,
    #[serde(default)]
    relative_humidity_2m: f64,
    #[serde(default)]
    pressure_msl: f64,
    #[serde(default)]
    wind_speed_10m: f64,
    #[serde(default)]
    wind_direction_10m: f64,
    #[serde(default)]
    weather_code: i32,
}

#[derive(Debug, Deserialize)]
struct OmCurrentResponse {
    current: OmCurrent,
}

#[derive(Debug, Deserialize)]
struct OmDaily {
    time: Vec<String>,
    temperature_2m_max: Vec<f64>,
    temperature_2m_min: Vec<f64>,
    #[serde(default)]
    precipitation_sum: Vec<Option<f64>>,
    #[serde(default)]
    relative_humidity_2m_mean: Vec<Option<f64>>,
    #[serde(default)]
    weather_code: Vec<i32>,
}

#[derive(Debug, Deserialize)]
struct OmForecastResponse {
    daily: OmDaily,
}

#[async_trait]
impl SourceAdapter for OpenMeteoSource {
    fn id(&self) -> &str {
        ProviderId::OpenMeteo.as_str()
    }

    async fn fetch_current(
        &self,
        city: &str,
        cancel: &CancellationToken,
    ) -> Result<Reading, FetchError> {
        let url = self.url(city, &[("current", CURRENT_FIELDS.to_string())])?;
        let body = self.fetcher.fetch(url.as_str(), cancel).await?;
        parse_current(city, &body)
    }

    async fn fetch_forecast(
        &self,
        city: &str,
        days: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ForecastDay>, FetchError> {
        let url = self.url(
            city,
            &[
                ("daily", DAILY_FIELDS.to_string()),
                ("forecast_days", days.to_string()),
            ],
        )?;
        let body = self.fetcher.fetch(url.as_str(), cancel).await?;
        parse_forecast(&body, days)
    }
}

fn parse_current(city: &str, body: &[u8]) -> Result<Reading, FetchError> {
    let parsed: OmCurrentResponse = serde_json::from_slice(body)?;
    let current = parsed.current;

    Ok(Reading {
        source: ProviderId::OpenMeteo.as_str().to_string(),
        city: city.to_string(),
        temperature_c: current.temperature_2m,
        feels_like_c: current.apparent_temperature.unwrap_or(current.temperature_2m),
        humidity_pct: current.relative_humidity_2m,
        pressure_hpa: current.pressure_msl,
        wind_speed_mps: current.wind_speed_10m,
        wind_direction_deg: current.wind_direction_10m,
        description: describe_code(current.weather_code).to_string(),
        icon: icon_for_code(current.weather_code).to_string(),
        observation_time: parse_time(&current.time)?,
    })
}

fn parse_forecast(body: &[u8], days: usize) -> Result<Vec<ForecastDay>, FetchError> {
    let daily = serde_json::from_slice::<OmForecastResponse>(body)?.daily;

    let available = daily
        .time
        .len()
        .min(daily.temperature_2m_max.len())
        .min(daily.temperature_2m_min.len());

    (0..available.min(days))
        .map(|i| -> Result<ForecastDay, FetchError> {
            let date = NaiveDate::parse_from_str(&daily.time[i], "%Y-%m-%d")
                .map_err(|e| FetchError::Parse(format!("bad date '{}': {e}", daily.time[i])))?;
            let max_temp_c = daily.temperature_2m_max[i];
            let min_temp_c = daily.temperature_2m_min[i];
            let code = daily.weather_code.get(i).copied().unwrap_or_default();

            Ok(ForecastDay {
                date,
                max_temp_c,
                min_temp_c,
                avg_temp_c: (max_temp_c + min_temp_c) / 2.0,
                humidity_pct: daily.relative_humidity_2m_mean.get(i).copied().flatten().unwrap_or(0.0),
                precipitation_mm: daily.precipitation_sum.get(i).copied().flatten().unwrap_or(0.0),
                description: describe_code(code).to_string(),
                icon: icon_for_code(code).to_string(),
            })
        })
        .collect()
}

// Open-Meteo reports local ISO time without offset; requests ask for UTC.
fn parse_time(raw: &str) -> Result<DateTime<Utc>, FetchError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
        .map(|naive| naive.and_utc())
        .map_err(|e| FetchError::Parse(format!("bad timestamp '{raw}': {e}")))
}

/// WMO weather interpretation code to a human description.
pub fn describe_code(code: i32) -> &'static str {
    match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 => "Foggy",
        48 => "Depositing rime fog",
        51 => "Light drizzle",
        53 => "Moderate drizzle",
        55 => "Dense drizzle",
        56 => "Light freezing drizzle",
        57 => "Dense freezing drizzle",
        61 => "Slight rain",
        63 => "Moderate rain",
        65 => "Heavy rain",
        66 => "Light freezing rain",
        67 => "Heavy freezing rain",
        71 => "Slight snow fall",
        73 => "Moderate snow fall",
        75 => "Heavy snow fall",
        77 => "Snow grains",
        80 => "Slight rain showers",
        81 => "Moderate rain showers",
        82 => "Violent rain showers",
        85 => "Slight snow showers",
        86 => "Heavy snow showers",
        95 => "Thunderstorm",
        96 => "Thunderstorm with slight hail",
        99 => "Thunderstorm with heavy hail",
        _ => "Unknown",
    }
}

/// WMO code to an OpenWeather-style icon id, so both sources share icons.
pub fn icon_for_code(code: i32) -> &'static str {
    match code {
        i32::MIN..=0 => "01d",
        1..=3 => "02d",
        4..=48 => "50d",
        49..=67 => "10d",
        68..=77 => "13d",
        78..=82 => "09d",
        83..=86 => "13d",
        _ => "11d",
    }
}
