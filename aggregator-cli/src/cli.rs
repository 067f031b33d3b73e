use std::time::Duration;

use aggregator_core::{
    Config, Coordinator, Scheduler, SchedulerSettings, coordinator::MAX_FORECAST_DAYS,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use inquire::{Password, PasswordDisplayMode};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::render;

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-agg", version, about = "Multi-source weather aggregator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials for a provider.
    Configure {
        /// Provider short name, e.g. "openweather" or "openmeteo".
        /// Defaults to the configured default provider.
        provider: Option<String>,

        /// Make this provider the default for later `configure` runs.
        #[arg(long)]
        default: bool,
    },

    /// Show consensus current weather for a city.
    Current {
        city: String,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show a consensus forecast for a city.
    Forecast {
        city: String,

        /// Number of days, 1 to 7.
        #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=MAX_FORECAST_DAYS as i64))]
        days: u8,

        #[arg(long)]
        json: bool,
    },

    /// Keep the cache warm on a schedule and print stats until Ctrl-C.
    Watch {
        /// Comma-separated cities; defaults to `default_cities` from config.
        #[arg(long, value_delimiter = ',')]
        cities: Vec<String>,
    },

    /// Refresh the default cities once and print stats.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Configure { provider, default } => configure(provider.as_deref(), default),
            Command::Current { city, json } => {
                let coordinator = coordinator()?;
                let weather = coordinator.get_current(&city).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&weather)?);
                } else {
                    print!("{}", render::current(&weather));
                }
                Ok(())
            }
            Command::Forecast { city, days, json } => {
                let coordinator = coordinator()?;
                let forecast = coordinator.get_forecast(&city, usize::from(days)).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&forecast)?);
                } else {
                    print!("{}", render::forecast(&forecast));
                }
                Ok(())
            }
            Command::Watch { cities } => watch(cities).await,
            Command::Stats { json } => {
                let cfg = Config::load()?;
                let coordinator = Coordinator::from_config(&cfg)?;
                let report = coordinator.refresh(&cfg.default_cities).await;
                let stats = coordinator.stats();

                if json {
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                } else {
                    print!("{}", render::report(&report));
                    print!("{}", render::stats(&stats));
                }
                Ok(())
            }
        }
    }
}

fn coordinator() -> anyhow::Result<Coordinator> {
    let cfg = Config::load()?;
    Coordinator::from_config(&cfg)
}

fn configure(provider: Option<&str>, make_default: bool) -> anyhow::Result<()> {
    let path = Config::config_file_path()?;
    // Load without env overrides so they are not persisted.
    let mut cfg = Config::load_from(&path)?;
    let id = cfg.resolve_provider(provider)?;

    if id.requires_api_key() {
        let api_key = Password::new(&format!("API key for {id}:"))
            .with_display_mode(PasswordDisplayMode::Masked)
            .without_confirmation()
            .prompt()
            .context("Failed to read API key")?;

        let api_key = api_key.trim().to_string();
        if api_key.is_empty() {
            anyhow::bail!("API key must not be empty");
        }
        cfg.upsert_provider_api_key(id, api_key);
    } else {
        println!("Provider '{id}' needs no API key.");
    }

    if make_default {
        cfg.set_default_provider(id);
    }
    if !cfg.sources.iter().any(|s| s.eq_ignore_ascii_case(id.as_str())) {
        cfg.sources.push(id.as_str().to_string());
    }

    cfg.save_to(&path)?;
    println!("Saved configuration to {}", path.display());
    Ok(())
}

async fn watch(cities: Vec<String>) -> anyhow::Result<()> {
    let cfg = Config::load()?;
    let cities = if cities.is_empty() {
        cfg.default_cities.clone()
    } else {
        cities
    };

    let coordinator = Coordinator::from_config(&cfg)?;
    let cancel = CancellationToken::new();
    let sweeper = coordinator.spawn_cache_sweeper(cancel.clone());

    let scheduler = Scheduler::new(
        coordinator.clone(),
        cities,
        SchedulerSettings::from_config(&cfg),
    );
    scheduler.start();

    let every = cfg.fetch_interval().max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                print!("{}", render::scheduler_status(&scheduler.status()));
                print!("{}", render::stats(&coordinator.stats()));
            }
        }
    }

    scheduler.stop();
    cancel.cancel();
    sweeper.await.context("cache sweeper task failed")?;
    Ok(())
}
