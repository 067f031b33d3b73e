use std::collections::HashSet;
use std::convert::TryFrom;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    Config,
    error::FetchError,
    fetcher::{HttpTransport, ReqwestTransport, ResilientFetcher},
    model::{ForecastDay, Reading},
    provider::{openmeteo::OpenMeteoSource, openweather::OpenWeatherSource},
};

pub mod openmeteo;
pub mod openweather;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    OpenWeather,
    OpenMeteo,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenWeather => "openweather",
            ProviderId::OpenMeteo => "openmeteo",
        }
    }

    pub const fn all() -> &'static [ProviderId] {
        &[ProviderId::OpenWeather, ProviderId::OpenMeteo]
    }

    pub fn requires_api_key(&self) -> bool {
        matches!(self, ProviderId::OpenWeather)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.trim().to_lowercase();

        match lower.as_str() {
            "openweather" => Ok(ProviderId::OpenWeather),
            "openmeteo" => Ok(ProviderId::OpenMeteo),
            _ => Err(anyhow!(
                "Unknown provider '{value}'. Supported providers: openweather, openmeteo."
            )),
        }
    }
}

/// One upstream weather provider.
///
/// Implementations translate the provider's wire format into [`Reading`]s and
/// [`ForecastDay`]s. A city the provider cannot resolve fails with
/// [`FetchError::NotFound`].
#[async_trait]
pub trait SourceAdapter: Send + Sync + Debug {
    /// Stable identifier used as the key in snapshots and consensus records.
    fn id(&self) -> &str;

    async fn fetch_current(
        &self,
        city: &str,
        cancel: &CancellationToken,
    ) -> Result<Reading, FetchError>;

    /// Up to `days` daily entries, earliest first.
    async fn fetch_forecast(
        &self,
        city: &str,
        days: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ForecastDay>, FetchError>;
}

/// Construct a single source from config over the given transport.
pub fn source_from_config(
    id: ProviderId,
    config: &Config,
    transport: Arc<dyn HttpTransport>,
) -> Result<Arc<dyn SourceAdapter>> {
    let fetcher = ResilientFetcher::new(
        id.as_str(),
        transport,
        config.retry_policy(),
        config.breaker_settings(),
    );
    let base_url = config.provider_base_url(id);

    let source: Arc<dyn SourceAdapter> = match id {
        ProviderId::OpenWeather => {
            let api_key = config.provider_api_key(id).ok_or_else(|| {
                anyhow!(
                    "No API key configured for provider '{id}'.\n\
                     Hint: run `weather-agg configure {id}` or set OPENWEATHER_API_KEY."
                )
            })?;
            let mut source = OpenWeatherSource::new(api_key.to_owned(), fetcher);
            if let Some(url) = base_url {
                source = source.with_base_url(url);
            }
            Arc::new(source)
        }
        ProviderId::OpenMeteo => {
            let mut source = OpenMeteoSource::new(fetcher);
            if let Some(url) = base_url {
                source = source.with_base_url(url);
            }
            Arc::new(source)
        }
    };

    Ok(source)
}

/// Construct every enabled source, sharing one reqwest client.
pub fn build_sources(config: &Config) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(config.request_timeout())?);
    build_sources_with(config, transport)
}

/// Like [`build_sources`], over a caller-provided transport.
///
/// Sources that cannot be constructed (e.g. a missing API key) are skipped
/// with a warning. It is an error if none remain.
pub fn build_sources_with(
    config: &Config,
    transport: Arc<dyn HttpTransport>,
) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    let mut seen = HashSet::new();
    let mut sources = Vec::new();

    for name in &config.sources {
        let id = ProviderId::try_from(name.as_str())?;
        if !seen.insert(id) {
            continue;
        }
        match source_from_config(id, config, Arc::clone(&transport)) {
            Ok(source) => sources.push(source),
            Err(err) => warn!(source = %id, error = %err, "source disabled"),
        }
    }

    if sources.is_empty() {
        bail!(
            "No weather sources available.\n\
             Hint: enable `openmeteo` in `sources` or configure an API key with `weather-agg configure openweather`."
        );
    }

    info!(
        sources = ?sources.iter().map(|s| s.id()).collect::<Vec<_>>(),
        "weather sources ready"
    );
    Ok(sources)
}
