use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Upstream message identifier, unique within one source.
///
/// Also serves as the historical paging cursor: the external API pages
/// strictly older than a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One fetched chat message, as returned upstream.
///
/// `posted_at` keeps whatever offset the source reported; it is normalized
/// only when written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub external_message_id: MessageId,
    pub posted_at: DateTime<FixedOffset>,
    pub author: Option<String>,
    pub text: String,
    #[serde(default)]
    pub views: Option<i64>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl Record {
    pub fn new(id: i64, posted_at: DateTime<FixedOffset>, text: impl Into<String>) -> Self {
        Self {
            external_message_id: MessageId(id),
            posted_at,
            author: None,
            text: text.into(),
            views: None,
            attachments: Vec::new(),
            reactions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: String,
    pub url: Option<String>,
    pub file_name: Option<String>,
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub count: i64,
}

/// Latest `posted_at` among `records`, as an absolute instant.
pub fn max_posted_at(records: &[Record]) -> Option<DateTime<FixedOffset>> {
    records.iter().map(|r| r.posted_at).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn max_posted_at_compares_instants_not_wall_clock() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let plus_five = FixedOffset::east_opt(5 * 3600).unwrap();
        // 10:00+05:00 is 05:00Z, earlier than 06:00Z.
        let a = Record::new(1, plus_five.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(), "a");
        let b = Record::new(2, utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap(), "b");

        assert_eq!(max_posted_at(&[a, b.clone()]), Some(b.posted_at));
        assert_eq!(max_posted_at(&[]), None);
    }

    #[test]
    fn record_deserializes_without_side_tables() {
        let json = r#"{
            "external_message_id": 42,
            "posted_at": "2024-03-01T12:00:00+02:00",
            "author": null,
            "text": "hello"
        }"#;
        let record: Record = serde_json::from_str(json).unwrap();
        assert_eq!(record.external_message_id, MessageId(42));
        assert!(record.attachments.is_empty());
        assert!(record.reactions.is_empty());
        assert_eq!(record.views, None);
    }
}
