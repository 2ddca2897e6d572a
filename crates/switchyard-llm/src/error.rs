//! Failures of a capability provider call.

use thiserror::Error;

/// Why a completion call produced no answer.
///
/// Only [`RateLimited`](Self::RateLimited) is treated as throttling by the
/// hub; everything else counts against the calling worker's circuit.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// No API key was given and the credential variable is unset.
    #[error("no credential: {env} is not set")]
    MissingCredential { env: String },

    /// The endpoint could not be reached or the connection broke.
    #[error("provider unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    /// The endpoint did not answer within the client timeout.
    #[error("provider did not answer in time")]
    TimedOut,

    /// HTTP 429. `retry_after_ms` is the provider's hint, or one second.
    #[error("provider throttled the call, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// HTTP 401/403: the credential was refused.
    #[error("credential refused: {0}")]
    Unauthorized(String),

    /// Any other non-success status.
    #[error("provider answered HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// A 2xx answer that is not a chat completion.
    #[error("unreadable completion: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether this is the provider's throttling signal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
