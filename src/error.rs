//! Error types for the Ratewarden library.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for rate limited execution.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Admission denied by the sliding window.
    #[error("Rate limit exceeded for {identifier}, resets at {reset_at}")]
    RateLimitExceeded {
        identifier: String,
        reset_at: DateTime<Utc>,
        retry_after: Duration,
    },

    /// The circuit for this identifier is open; the call was not attempted.
    #[error("Circuit open for {identifier}, retry after {retry_after:?}")]
    CircuitOpen {
        identifier: String,
        retry_after: Duration,
    },

    /// The pending queue for this identifier is at capacity.
    #[error("Queue full for {identifier} (capacity {capacity})")]
    QueueFull { identifier: String, capacity: usize },

    /// The wrapped call itself failed.
    #[error("Upstream call failed for {identifier}: {source}")]
    Upstream {
        identifier: String,
        #[source]
        source: CallError,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// How long the caller should wait before trying again, if known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitError::RateLimitExceeded { retry_after, .. }
            | RateLimitError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            RateLimitError::Upstream {
                source: CallError::RateLimited { retry_after },
                ..
            } => *retry_after,
            _ => None,
        }
    }

    /// Whether this error is a "try again later" signal rather than a hard failure.
    pub fn is_throttled(&self) -> bool {
        matches!(
            self,
            RateLimitError::RateLimitExceeded { .. }
                | RateLimitError::CircuitOpen { .. }
                | RateLimitError::QueueFull { .. }
                | RateLimitError::Upstream {
                    source: CallError::RateLimited { .. },
                    ..
                }
        )
    }
}

/// Failure reported by a call executed under a rate limit.
#[derive(Error, Debug)]
pub enum CallError {
    /// The upstream rejected the call for rate limiting (HTTP 429 or equivalent).
    #[error("upstream rate limited the call")]
    RateLimited { retry_after: Option<Duration> },

    /// Any other failure. Never retried.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl CallError {
    /// Wrap an arbitrary error as a non-retryable call failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CallError::Failed(anyhow::Error::new(err))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, CallError::RateLimited { .. })
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
