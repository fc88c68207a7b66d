//! Per-tick, per-source attempt results.
//!
//! [`ParseOutcome`] is a closed set of variants, each with a fixed field set.
//! Consumers match on it instead of probing for optional fields.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::record::MessageId;
use crate::source::SourceId;
use crate::time::StorageTimestamp;

/// Fetch direction chosen for a source on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    Historical,
    Incremental,
}

impl ParseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for ParseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat status label, used for the `status` metric label and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Partial,
    Error,
    Skipped,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of persisting one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistReport {
    pub inserted: u64,
    pub skipped_duplicates: u64,
    /// Max `posted_at` across the whole batch, duplicates included.
    pub max_timestamp: Option<StorageTimestamp>,
    pub associations_created: u64,
}

/// Where an unfinished fetch left off.
///
/// Everything from the upstream head at the time of the first unfinished run
/// down to `before` is committed, and `committed_max` is the newest
/// `posted_at` among it. The next run pages older than `before`; once it
/// reaches the lower bound the watermark may move to `committed_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub before: MessageId,
    pub committed_max: StorageTimestamp,
}

/// What happened to one source on one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ParseOutcome {
    /// Every page fetched and the batch committed.
    Success {
        records_fetched: u64,
        persisted: PersistReport,
        /// Whether the durable watermark moved forward.
        watermark_advanced: bool,
    },
    /// The fetch stopped above its lower bound, either because a later page
    /// failed or because the page budget ran out. What was fetched is
    /// committed, but the watermark is left alone until the gap is read.
    Partial {
        records_fetched: u64,
        persisted: PersistReport,
        /// `None` when the page budget ran out.
        error_kind: Option<ErrorKind>,
        message: String,
        resume: Option<ResumePoint>,
    },
    Error {
        error_kind: ErrorKind,
        message: String,
    },
    /// Not attempted this tick (recent permanent failure).
    Skipped { reason: String },
}

impl ParseOutcome {
    pub fn status(&self) -> AttemptStatus {
        match self {
            Self::Success { .. } => AttemptStatus::Success,
            Self::Partial { .. } => AttemptStatus::Partial,
            Self::Error { .. } => AttemptStatus::Error,
            Self::Skipped { .. } => AttemptStatus::Skipped,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Partial { error_kind, .. } => *error_kind,
            Self::Error { error_kind, .. } => Some(*error_kind),
            Self::Success { .. } | Self::Skipped { .. } => None,
        }
    }

    pub fn resume(&self) -> Option<ResumePoint> {
        match self {
            Self::Partial { resume, .. } => *resume,
            _ => None,
        }
    }

    pub fn records_fetched(&self) -> u64 {
        match self {
            Self::Success { records_fetched, .. } | Self::Partial { records_fetched, .. } => *records_fetched,
            Self::Error { .. } | Self::Skipped { .. } => 0,
        }
    }

    pub fn records_persisted(&self) -> u64 {
        match self {
            Self::Success { persisted, .. } | Self::Partial { persisted, .. } => persisted.inserted,
            Self::Error { .. } | Self::Skipped { .. } => 0,
        }
    }

    pub fn max_timestamp(&self) -> Option<StorageTimestamp> {
        match self {
            Self::Success { persisted, .. } | Self::Partial { persisted, .. } => persisted.max_timestamp,
            Self::Error { .. } | Self::Skipped { .. } => None,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            error_kind: kind,
            message: message.into(),
        }
    }
}

/// One tick × source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseAttempt {
    pub source_id: SourceId,
    /// `None` when the source was skipped before a mode was decided.
    pub mode: Option<ParseMode>,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub outcome: ParseOutcome,
}

impl ParseAttempt {
    pub fn status(&self) -> AttemptStatus {
        self.outcome.status()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
