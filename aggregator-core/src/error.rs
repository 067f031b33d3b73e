use thiserror::Error;

/// Failure of a single outbound call or adapter operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("request rejected with HTTP {0}")]
    ClientRejected(u16),

    #[error("server error HTTP {0}")]
    ServerError(u16),

    #[error("malformed payload: {0}")]
    Parse(String),

    #[error("circuit breaker open for source '{0}'")]
    BreakerOpen(String),

    #[error("city not found: {0}")]
    NotFound(String),

    #[error("request cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether another attempt may succeed within the same retry sequence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transport(_) | FetchError::RateLimited | FetchError::ServerError(_)
        )
    }

    /// Classify an HTTP status. `None` means success.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(FetchError::RateLimited),
            400..=499 => Some(FetchError::ClientRejected(status)),
            500..=599 => Some(FetchError::ServerError(status)),
            other => Some(FetchError::Transport(format!("unexpected HTTP status {other}"))),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Parse(err.to_string())
    }
}

/// Failures surfaced by the coordinator to its callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregatorError {
    #[error("all sources failed for city '{0}'")]
    AllSourcesFailed(String),

    #[error("weather data not available for city '{0}'")]
    NotAvailable(String),

    #[error("refresh deadline exceeded for city '{0}'")]
    DeadlineExceeded(String),

    #[error("days must be between 1 and {max}, got {got}")]
    InvalidDays { got: usize, max: usize },

    #[error("no weather sources configured")]
    NoSources,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert_eq!(FetchError::from_status(200), None);
        assert_eq!(FetchError::from_status(204), None);
        assert_eq!(FetchError::from_status(429), Some(FetchError::RateLimited));
        assert_eq!(FetchError::from_status(404), Some(FetchError::ClientRejected(404)));
        assert_eq!(FetchError::from_status(503), Some(FetchError::ServerError(503)));
    }

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(FetchError::Transport("reset".into()).is_retryable());
        assert!(FetchError::RateLimited.is_retryable());
        assert!(FetchError::ServerError(500).is_retryable());

        assert!(!FetchError::ClientRejected(401).is_retryable());
        assert!(!FetchError::Parse("eof".into()).is_retryable());
        assert!(!FetchError::BreakerOpen("x".into()).is_retryable());
        assert!(!FetchError::NotFound("Atlantis".into()).is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }
}
