use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::fetcher::{BreakerSettings, RetryPolicy};
use crate::provider::ProviderId;

pub const OPENWEATHER_API_KEY_ENV: &str = "OPENWEATHER_API_KEY";
pub const DEFAULT_CITIES_ENV: &str = "DEFAULT_CITIES";

/// Configuration for a single provider (API key, endpoint override).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub fetch_interval_secs: u64,
    pub refresh_timeout_secs: u64,
    pub on_demand_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fetch_interval_secs: 900,
            refresh_timeout_secs: 60,
            on_demand_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_size: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            max_size: 1000,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_ms: u64,
    pub multiplier: f64,
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1000,
            multiplier: 2.0,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub min_requests: u32,
    pub failure_ratio: f64,
    pub timeout_secs: u64,
    pub window_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 3,
            failure_ratio: 0.6,
            timeout_secs: 30,
            window_secs: 60,
        }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// ```toml
/// sources = ["openmeteo", "openweather"]
/// default_cities = ["Prague", "London"]
///
/// [providers.openweather]
/// api_key = "..."
///
/// [cache]
/// ttl_secs = 300
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enabled sources, by provider id.
    pub sources: Vec<String>,
    pub default_cities: Vec<String>,
    /// Provider `configure` targets when none is named.
    pub default_provider: Option<String>,
    pub providers: HashMap<String, ProviderConfig>,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: vec![
                ProviderId::OpenMeteo.as_str().to_string(),
                ProviderId::OpenWeather.as_str().to_string(),
            ],
            default_cities: vec!["Prague".into(), "London".into(), "NewYork".into()],
            default_provider: None,
            providers: HashMap::new(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl Config {
    /// Return the default provider as a strongly-typed ProviderId.
    pub fn default_provider_id(&self) -> Result<ProviderId> {
        let s = self.default_provider.as_ref().ok_or_else(|| {
            anyhow!(
                "No default provider configured.\n\
                 Hint: run `weather-agg configure <provider>` (e.g. `weather-agg configure openweather`) first."
            )
        })?;

        ProviderId::try_from(s.as_str())
    }

    pub fn set_default_provider(&mut self, id: ProviderId) {
        self.default_provider = Some(id.as_str().to_string());
    }

    /// The provider named on the command line, else the configured default.
    pub fn resolve_provider(&self, name: Option<&str>) -> Result<ProviderId> {
        match name {
            Some(name) => ProviderId::try_from(name),
            None => self.default_provider_id(),
        }
    }

    /// Load config from the platform config dir with environment overrides applied,
    /// or defaults if the file doesn't exist yet.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        let mut cfg = Self::load_from(&path)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load config from an explicit path, without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to the platform config dir.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    /// Save config to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "weather-agg", "weather-agg")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup` (`OPENWEATHER_API_KEY`, `DEFAULT_CITIES`).
    /// Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(OPENWEATHER_API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.providers
                .entry(ProviderId::OpenWeather.as_str().to_string())
                .or_default()
                .api_key = key.trim().to_string();
        }

        if let Some(raw) = lookup(DEFAULT_CITIES_ENV) {
            let cities: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
            if !cities.is_empty() {
                self.default_cities = cities;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.max_size == 0 {
            bail!("cache.max_size must be greater than zero");
        }
        if self.scheduler.fetch_interval_secs == 0 {
            bail!("scheduler.fetch_interval_secs must be greater than zero");
        }
        if self.cache.sweep_interval_secs == 0 {
            bail!("cache.sweep_interval_secs must be greater than zero");
        }
        if self.breaker.window_secs == 0 {
            bail!("breaker.window_secs must be greater than zero");
        }
        if self.retry.multiplier < 1.0 {
            bail!(
                "retry.multiplier must be at least 1.0, got {}",
                self.retry.multiplier
            );
        }
        if !(self.breaker.failure_ratio > 0.0 && self.breaker.failure_ratio <= 1.0) {
            bail!(
                "breaker.failure_ratio must be in (0, 1], got {}",
                self.breaker.failure_ratio
            );
        }
        for name in &self.sources {
            ProviderId::try_from(name.as_str())?;
        }
        Ok(())
    }

    /// Set/replace a provider API key; the first configured provider becomes the default.
    pub fn upsert_provider_api_key(&mut self, provider_id: ProviderId, api_key: String) {
        self.providers
            .entry(provider_id.as_str().to_string())
            .or_default()
            .api_key = api_key;

        if self.default_provider.is_none() {
            self.default_provider = Some(provider_id.to_string());
        }
    }

    /// Returns the API key for a provider, if a non-empty one is present.
    pub fn provider_api_key(&self, provider_id: ProviderId) -> Option<&str> {
        self.providers
            .get(provider_id.as_str())
            .map(|cfg| cfg.api_key.as_str())
            .filter(|key| !key.is_empty())
    }

    pub fn provider_base_url(&self, provider_id: ProviderId) -> Option<&str> {
        self.providers
            .get(provider_id.as_str())
            .and_then(|cfg| cfg.base_url.as_deref())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            delay: Duration::from_millis(self.retry.delay_ms),
            multiplier: self.retry.multiplier,
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            min_requests: self.breaker.min_requests,
            failure_ratio: self.breaker.failure_ratio,
            timeout: Duration::from_secs(self.breaker.timeout_secs),
            window: Duration::from_secs(self.breaker.window_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.retry.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_secs)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.fetch_interval_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.refresh_timeout_secs)
    }

    pub fn on_demand_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.on_demand_timeout_secs)
    }
}
