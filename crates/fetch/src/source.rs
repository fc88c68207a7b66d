//! The abstract upstream call.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chatsync_core::{MessageId, Record};

use crate::error::SourceError;

/// Which slice of a channel to read.
///
/// The upstream API only pages backward. There is deliberately no variant
/// that takes a timestamp: a "since" bound is applied client-side by the
/// fetcher and can never be sent as a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "direction", content = "cursor", rename_all = "snake_case")]
pub enum FetchDirection {
    /// The newest `limit` messages.
    Newest,
    /// Up to `limit` messages strictly older than the given message.
    OlderThan(MessageId),
}

impl fmt::Display for FetchDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Newest => f.write_str("newest"),
            Self::OlderThan(id) => write!(f, "older_than({id})"),
        }
    }
}

/// A chat/channel API the scheduler ingests from.
///
/// Pages come back newest first. Implementations map upstream responses to
/// [`SourceError`] variants and must not retry internally.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch(
        &self,
        identity: &str,
        direction: FetchDirection,
        limit: u32,
    ) -> Result<Vec<Record>, SourceError>;
}
