//! Per-source circuit breaker.
//!
//! Closed while the source behaves. Trips to open once the rolling window has
//! seen enough requests with a high enough failure ratio, rejects everything
//! while open, then lets exactly one probe through after the timeout.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Minimum requests in the window before the breaker may trip.
    pub min_requests: u32,
    /// Failure ratio (failures / requests) at which the breaker trips.
    pub failure_ratio: f64,
    /// How long the breaker stays open before admitting a probe.
    pub timeout: Duration,
    /// Length of the rolling window in the closed state.
    pub window: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            min_requests: 3,
            failure_ratio: 0.6,
            timeout: Duration::from_secs(30),
            window: Duration::from_secs(60),
        }
    }
}

/// Result of a guarded call, as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// The caller gave up; neither success nor failure.
    Abandoned,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    requests: u32,
    failures: u32,
    window_start: Instant,
    opened_at: Instant,
    changed_at: Instant,
    probe_in_flight: bool,
}

/// An admitted call. Dropped before it settles, it counts as abandoned,
/// which also frees the half-open probe slot.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.generation, Outcome::Abandoned);
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                requests: 0,
                failures: 0,
                window_start: now,
                opened_at: now,
                changed_at: now,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, taking an elapsed open timeout into account.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Rolling `(requests, failures)` counts for the current generation.
    pub fn counts(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.requests, inner.failures)
    }

    /// Instant of the most recent state transition.
    pub fn last_transition(&self) -> Instant {
        self.inner.lock().changed_at
    }

    /// Run `call` under the breaker. Rejected calls never invoke `call`.
    pub async fn call<F, Fut, T>(&self, call: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let generation = self.admit()?;
        let mut pending = PendingCall {
            breaker: self,
            generation,
            settled: false,
        };

        let result = call().await;
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(FetchError::Cancelled) => Outcome::Abandoned,
            Err(_) => Outcome::Failure,
        };
        pending.settled = true;
        self.record(generation, outcome);
        result
    }

    fn admit(&self) -> Result<u64, FetchError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());

        match inner.state {
            BreakerState::Closed => {
                inner.requests += 1;
                Ok(inner.generation)
            }
            BreakerState::Open => {
                debug!(source = %self.name, "circuit open, rejecting call");
                Err(FetchError::BreakerOpen(self.name.clone()))
            }
            BreakerState::HalfOpen if inner.probe_in_flight => {
                debug!(source = %self.name, "probe already in flight, rejecting call");
                Err(FetchError::BreakerOpen(self.name.clone()))
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = true;
                inner.requests += 1;
                Ok(inner.generation)
            }
        }
    }

    fn record(&self, generation: u64, outcome: Outcome) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);

        // Result belongs to a window that no longer exists.
        if inner.generation != generation {
            return;
        }

        match (inner.state, outcome) {
            (BreakerState::Closed, Outcome::Success) => {}
            (BreakerState::Closed, Outcome::Failure) => {
                inner.failures += 1;
                if self.should_trip(&inner) {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            (BreakerState::Closed, Outcome::Abandoned) => {
                inner.requests = inner.requests.saturating_sub(1);
            }
            (BreakerState::HalfOpen, Outcome::Success) => {
                self.transition(&mut inner, BreakerState::Closed, now);
            }
            (BreakerState::HalfOpen, Outcome::Failure) => {
                self.transition(&mut inner, BreakerState::Open, now);
            }
            (BreakerState::HalfOpen, Outcome::Abandoned) => {
                inner.probe_in_flight = false;
                inner.requests = inner.requests.saturating_sub(1);
            }
            (BreakerState::Open, _) => {}
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        if inner.requests < self.settings.min_requests || inner.requests == 0 {
            return false;
        }
        let ratio = f64::from(inner.failures) / f64::from(inner.requests);
        ratio >= self.settings.failure_ratio
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            BreakerState::Closed => {
                if now.duration_since(inner.window_start) >= self.settings.window {
                    inner.generation += 1;
                    inner.requests = 0;
                    inner.failures = 0;
                    inner.window_start = now;
                }
            }
            BreakerState::Open => {
                if now.duration_since(inner.opened_at) >= self.settings.timeout {
                    self.transition(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }

        info!(source = %self.name, %from, %to, "circuit breaker state changed");

        inner.state = to;
        inner.generation += 1;
        inner.requests = 0;
        inner.failures = 0;
        inner.window_start = now;
        inner.changed_at = now;
        inner.probe_in_flight = false;
        if to == BreakerState::Open {
            inner.opened_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerSettings {
                min_requests: 3,
                failure_ratio: 0.6,
                timeout: Duration::from_secs(30),
                window: Duration::from_secs(60),
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), FetchError> {
        b.call(|| async { Err::<(), _>(FetchError::ServerError(500)) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), FetchError> {
        b.call(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_three_failures() {
        let b = breaker();
        for _ in 0..2 {
            assert_eq!(fail(&b).await, Err(FetchError::ServerError(500)));
            assert_eq!(b.state(), BreakerState::Closed);
        }
        assert_eq!(fail(&b).await, Err(FetchError::ServerError(500)));
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn low_failure_ratio_keeps_breaker_closed() {
        let b = breaker();
        succeed(&b).await.unwrap();
        succeed(&b).await.unwrap();
        let _ = fail(&b).await;
        succeed(&b).await.unwrap();
        let _ = fail(&b).await;

        // 2 failures out of 5 requests is below 0.6.
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_does_not_invoke_call() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }

        let mut invoked = false;
        let res = b
            .call(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;

        assert_eq!(res, Err(FetchError::BreakerOpen("test".into())));
        assert!(!invoked);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes_breaker() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.counts(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens_and_restarts_timer() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_probe() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let probe = b.call(|| async move {
            let _ = wait.await;
            Ok(())
        });
        let second = async {
            tokio::task::yield_now().await;
            let res = succeed(&b).await;
            let _ = release.send(());
            res
        };

        let (probe_res, second_res) = tokio::join!(probe, second);
        assert_eq!(probe_res, Ok(()));
        assert_eq!(second_res, Err(FetchError::BreakerOpen("test".into())));
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_forgets_old_failures() {
        let b = breaker();
        let _ = fail(&b).await;
        let _ = fail(&b).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = fail(&b).await;

        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.counts(), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_calls_are_not_counted() {
        let b = breaker();
        for _ in 0..3 {
            let _ = b
                .call(|| async { Err::<(), _>(FetchError::Cancelled) })
                .await;
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.counts(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_frees_the_half_open_slot() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let stalled = tokio::time::timeout(
            Duration::from_secs(1),
            b.call(|| std::future::pending::<Result<(), FetchError>>()),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_call_is_not_counted() {
        let b = breaker();
        let stalled = tokio::time::timeout(
            Duration::from_secs(1),
            b.call(|| std::future::pending::<Result<(), FetchError>>()),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(b.counts(), (0, 0));
    }
}
