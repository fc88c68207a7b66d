use std::time::Duration;

use thiserror::Error;

use chatsync_core::ErrorKind;

/// Raw outcome of a single upstream call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// The source asked us to back off for exactly `wait`.
    #[error("rate limited, retry after {wait:?}")]
    RateLimited { wait: Duration },

    /// Timeout, connection reset, 5xx.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// The identity does not resolve to a channel.
    #[error("source not found: {0}")]
    NotFound(String),
}

/// Outcome of a fetch call after the retry policy has been applied.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("transient failures exhausted {attempts} attempts: {last}")]
    Transient { attempts: u32, last: String },

    #[error("rate limited {waits} times in one call, last wait {last_wait:?}")]
    RateLimitExhausted { waits: u32, last_wait: Duration },

    /// No usable identity, or upstream says the identity does not exist.
    /// Never retried.
    #[error("source cannot be resolved: {0}")]
    Unresolvable(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::TransientFetch,
            Self::RateLimitExhausted { .. } => ErrorKind::RateLimited,
            Self::Unresolvable(_) => ErrorKind::PermanentResolution,
        }
    }
}
