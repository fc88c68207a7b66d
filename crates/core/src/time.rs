//! The storage timestamp boundary.
//!
//! Upstream payloads carry timestamps with arbitrary embedded offsets. Storage
//! columns are offset-free `TIMESTAMP` values interpreted as UTC. The only way
//! to obtain a [`StorageTimestamp`] from an in-memory time value is
//! [`StorageTimestamp::normalize`], and every store method that writes a
//! timestamp takes a `StorageTimestamp`, so an un-normalized value cannot reach
//! a write path.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Offset-free wall-clock time interpreted as UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageTimestamp(NaiveDateTime);

impl StorageTimestamp {
    /// Convert any zoned time to UTC and drop the offset.
    pub fn normalize<Tz: TimeZone>(ts: &DateTime<Tz>) -> Self {
        Self(ts.with_timezone(&Utc).naive_utc())
    }

    /// Wrap a value read back from a storage column.
    ///
    /// Values in storage were written through [`normalize`](Self::normalize),
    /// so no conversion happens here. Not for use on write paths.
    pub fn from_stored(naive: NaiveDateTime) -> Self {
        Self(naive)
    }

    pub fn as_naive(&self) -> NaiveDateTime {
        self.0
    }

    pub fn to_utc(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.0)
    }

    /// Microseconds since the epoch; used in idempotency keys.
    pub fn timestamp_micros(&self) -> i64 {
        self.0.and_utc().timestamp_micros()
    }
}

impl fmt::Display for StorageTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Z", self.0.format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for StorageTimestamp {
    fn from(ts: DateTime<Tz>) -> Self {
        Self::normalize(&ts)
    }
}
