//! Periodic refresh driver.
//!
//! A cycle runs immediately on start and then once per interval. Each cycle
//! is its own task; a tick that arrives while the previous scheduled cycle is
//! still running is dropped, not queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::coordinator::{Coordinator, RefreshReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    /// Deadline applied to every cycle.
    pub refresh_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(900),
            refresh_timeout: Duration::from_secs(60),
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.fetch_interval(),
            refresh_timeout: config.refresh_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval: Duration,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub cities: Vec<String>,
}

#[derive(Debug, Default)]
struct RunTimes {
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    coordinator: Coordinator,
    settings: SchedulerSettings,
    cities: RwLock<Vec<String>>,
    /// Cancels the tick loop; `None` while stopped.
    loop_cancel: Mutex<Option<CancellationToken>>,
    in_flight: AtomicBool,
    times: Mutex<RunTimes>,
}

/// Clears the in-flight flag when a scheduled cycle ends, even on panic.
struct InFlightGuard(Arc<Inner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(coordinator: Coordinator, cities: Vec<String>, settings: SchedulerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                coordinator,
                settings,
                cities: RwLock::new(cities),
                loop_cancel: Mutex::new(None),
                in_flight: AtomicBool::new(false),
                times: Mutex::new(RunTimes::default()),
            }),
        }
    }

    /// Start the tick loop. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let mut loop_cancel = self.inner.loop_cancel.lock();
        if loop_cancel.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        *loop_cancel = Some(cancel.clone());
        drop(loop_cancel);

        let this = self.clone();
        tokio::spawn(async move { this.run_loop(cancel).await });

        info!(interval = ?self.inner.settings.interval, "scheduler started");
        true
    }

    /// Stop ticking. A cycle already in flight runs to completion.
    /// Returns `false` if the scheduler was not running.
    pub fn stop(&self) -> bool {
        let Some(cancel) = self.inner.loop_cancel.lock().take() else {
            return false;
        };
        cancel.cancel();
        self.inner.times.lock().next_run = None;

        info!("scheduler stopped");
        true
    }

    pub fn state(&self) -> SchedulerState {
        if self.inner.loop_cancel.lock().is_some() {
            SchedulerState::Running
        } else {
            SchedulerState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Run a cycle now, regardless of whether a scheduled one is in flight.
    pub fn trigger_now(&self) -> JoinHandle<RefreshReport> {
        info!("manually triggering refresh");
        let this = self.clone();
        tokio::spawn(async move { this.run_cycle().await })
    }

    pub fn update_cities(&self, cities: Vec<String>) {
        info!(?cities, "scheduler cities updated");
        *self.inner.cities.write() = cities;
    }

    pub fn status(&self) -> SchedulerStatus {
        let times = self.inner.times.lock();
        SchedulerStatus {
            running: self.is_running(),
            interval: self.inner.settings.interval,
            last_run: times.last_run,
            next_run: times.next_run,
            cities: self.inner.cities.read().clone(),
        }
    }

    async fn run_loop(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.inner.times.lock().next_run = chrono::Duration::from_std(self.inner.settings.interval)
                        .ok()
                        .and_then(|interval| Utc::now().checked_add_signed(interval));
                    self.spawn_scheduled_cycle();
                }
            }
        }
        debug!("scheduler loop exited");
    }

    fn spawn_scheduled_cycle(&self) {
        if self.inner.in_flight.swap(true, Ordering::AcqRel) {
            debug!("previous cycle still running, skipping tick");
            return;
        }

        let guard = InFlightGuard(Arc::clone(&self.inner));
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            this.run_cycle().await;
        });
    }

    async fn run_cycle(&self) -> RefreshReport {
        let cities = self.inner.cities.read().clone();
        self.inner.times.lock().last_run = Some(Utc::now());
        info!(?cities, "starting weather refresh");

        let report = self
            .inner
            .coordinator
            .refresh_with_deadline(&cities, self.inner.settings.refresh_timeout)
            .await;

        if report.is_success() {
            info!(cities = report.succeeded.len(), "weather refresh completed");
        } else {
            error!(
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "weather refresh finished with failures"
            );
        }
        report
    }
}
