//! Resilient outbound fetching: bounded retry with exponential backoff,
//! wrapped in a per-source circuit breaker.
//!
//! Status handling:
//! - 2xx: success
//! - 429, 5xx, transport errors: retried
//! - other 4xx: fail immediately, remaining retries are not used

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;

pub mod breaker;
pub mod transport;

pub use breaker::{BreakerSettings, BreakerState, CircuitBreaker};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Wait before the first retry.
    pub delay: Duration,
    /// Growth factor applied to each further wait.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt `attempt` (1-based retry number): `delay * multiplier^(attempt-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let nanos = self.delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= u64::MAX as f64 {
            return Duration::from_nanos(u64::MAX);
        }
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// Provider-agnostic GET with retry, backoff and a circuit breaker.
#[derive(Debug)]
pub struct ResilientFetcher {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ResilientFetcher {
    pub fn new(
        source: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        policy: RetryPolicy,
        breaker: BreakerSettings,
    ) -> Self {
        Self {
            transport,
            policy,
            breaker: CircuitBreaker::new(source, breaker),
        }
    }

    pub fn source(&self) -> &str {
        self.breaker.name()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetch `url`, returning the response body of the first 2xx answer.
    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        self.breaker
            .call(|| self.fetch_with_retry(url, cancel))
            .await
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        let source = self.source();
        let mut last_error = None;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let delay = self.policy.delay_for_attempt(attempt);
                debug!(source, attempt, ?delay, "retrying request");

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                res = self.transport.get(url) => res,
            };

            let err = match outcome {
                Ok(res) => match FetchError::from_status(res.status) {
                    None => {
                        if attempt > 0 {
                            debug!(source, attempt, "request succeeded after retries");
                        }
                        return Ok(res.body);
                    }
                    Some(err) => err,
                },
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(source, error = %err, "non-retryable failure");
                return Err(err);
            }

            warn!(
                source,
                attempt = attempt + 1,
                of = self.policy.max_retries + 1,
                error = %err,
                "request attempt failed"
            );
            last_error = Some(err);
        }

        Err(last_error.unwrap_or_else(|| FetchError::Transport("no attempt was made".into())))
    }
}
