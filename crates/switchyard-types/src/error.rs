//! Error types for the switchyard hub.
//!
//! [`SwitchyardError`] is the top-level error shared by every crate in the
//! workspace. It is non-exhaustive so new failure classes can be added
//! without breaking downstream matches.

use thiserror::Error;

/// Top-level error type for the switchyard hub.
///
/// Variants are grouped into recoverable (rate-limit, timeout, worker and
/// circuit failures) and fatal (safety block, config, I/O) categories. The
/// repair loop only ever retries the recoverable group.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SwitchyardError {
    // ── Recoverable ──────────────────────────────────────────────────

    /// The capability provider or the local limiter is throttling calls.
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited {
        /// Suggested wait time in milliseconds before retrying.
        retry_after_ms: u64,
    },

    /// An operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Human-readable name of the operation that timed out.
        operation: String,
    },

    /// A worker returned an error.
    #[error("worker {worker} failed: {message}")]
    Worker {
        /// Id of the failing worker.
        worker: String,
        /// Failure description.
        message: String,
    },

    /// The worker's circuit breaker is open.
    #[error("circuit open for worker {worker}")]
    CircuitOpen {
        /// Id of the worker whose circuit is open.
        worker: String,
    },

    /// The capability provider returned a non rate-limit error.
    #[error("provider error: {message}")]
    Provider {
        /// Provider-supplied error message.
        message: String,
    },

    /// A result did not meet the task's expectation.
    #[error("verification failed: {analysis}")]
    VerificationFailed {
        /// The verifier's explanation.
        analysis: String,
    },

    // ── Fatal ────────────────────────────────────────────────────────

    /// The admission gate refused the request.
    #[error("blocked by safety check: {reason}")]
    SafetyBlocked {
        /// Why the request was refused.
        reason: String,
    },

    /// Configuration is malformed or semantically invalid.
    #[error("invalid config: {reason}")]
    ConfigInvalid {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The event channel is full or closed.
    #[error("channel error: {0}")]
    Channel(String),
}

impl SwitchyardError {
    /// Whether the repair loop may attempt a retry for this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::Worker { .. }
                | Self::CircuitOpen { .. }
                | Self::Provider { .. }
                | Self::VerificationFailed { .. }
        )
    }

    /// Whether this error signals throttling, either typed or by message.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Worker { message, .. } | Self::Provider { message } => {
                looks_like_rate_limit(message)
            }
            _ => false,
        }
    }
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate_limit",
    "rate limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
];

/// Classify a free-form error message as a rate-limit signal.
///
/// Upstream failures that lost their type on the way (for example a worker
/// that stringified a provider error) are recognized by these markers.
pub fn looks_like_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// A convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SwitchyardError>;
