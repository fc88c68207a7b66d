use thiserror::Error;

use chatsync_core::{ConfigError, MessageId};

/// Errors from the durable backends (watermarks, locks, records, registry).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[cfg(feature = "redis-lock")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("record {message_id} rejected: {reason}")]
    Rejected { message_id: MessageId, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
