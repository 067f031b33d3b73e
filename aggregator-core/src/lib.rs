//! Core library for the `weather-agg` CLI.
//!
//! This crate defines:
//! - Configuration & credentials handling
//! - A resilient fetcher (retry, backoff, circuit breaker) and the source adapters built on it
//! - The aggregation engine that merges per-source readings into a consensus
//! - A TTL cache, the refresh coordinator and the periodic scheduler
//!
//! It is used by `aggregator-cli`, but can also be embedded in other binaries or services.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod model;
pub mod provider;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use cache::WeatherCache;
pub use config::{Config, ProviderConfig};
pub use coordinator::{Coordinator, CoordinatorSettings, RefreshReport};
pub use error::{AggregatorError, FetchError};
pub use model::{CacheStats, ConsensusCurrent, ConsensusForecast, ForecastDay, Reading, Snapshot, Stats};
pub use provider::{ProviderId, SourceAdapter, build_sources};
pub use scheduler::{Scheduler, SchedulerSettings, SchedulerState, SchedulerStatus};
