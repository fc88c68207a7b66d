use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("missing config key: {0}")]
    Missing(String),
}

/// Classification of a per-source failure, recorded on every failed attempt
/// and used as the `reason` label on counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts and connection resets that survived the retry budget.
    TransientFetch,
    /// The mandated rate-limit waits were exhausted.
    RateLimited,
    /// The source has no usable upstream identity. Never retried.
    PermanentResolution,
    /// The batch transaction was rolled back.
    Persistence,
    /// The durable watermark could not be read or written.
    WatermarkUnavailable,
    /// A panic or other bug caught at the dispatch boundary.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientFetch => "transient_fetch",
            Self::RateLimited => "rate_limited",
            Self::PermanentResolution => "permanent_resolution",
            Self::Persistence => "persistence",
            Self::WatermarkUnavailable => "watermark_unavailable",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
