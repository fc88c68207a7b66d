//! Durable per-source high-water mark.
//!
//! The watermark is the max `posted_at` of records known to be committed for
//! a source. It only moves forward, except through [`WatermarkStore::reset`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, info};

use chatsync_core::{SourceId, StorageTimestamp};

use crate::error::StoreError;

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Durable value for `source_id`, `None` if never set or reset.
    async fn get(&self, source_id: SourceId) -> Result<Option<StorageTimestamp>, StoreError>;

    /// Store `candidate` iff it is newer than the current value.
    /// Returns whether the stored value changed.
    async fn advance(&self, source_id: SourceId, candidate: StorageTimestamp) -> Result<bool, StoreError>;

    /// Administrative clear. The next decision for the source is historical.
    async fn reset(&self, source_id: SourceId) -> Result<(), StoreError>;
}

// ── PostgreSQL ───────────────────────────────────────────────────────

/// `source_watermarks` table. The compare-and-set happens inside one
/// `INSERT .. ON CONFLICT .. WHERE` statement, so concurrent advances for the
/// same source serialize on the row and the larger value always wins.
#[derive(Debug, Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn get(&self, source_id: SourceId) -> Result<Option<StorageTimestamp>, StoreError> {
        let row = sqlx::query_scalar::<_, Option<NaiveDateTime>>(
            "SELECT max_record_timestamp FROM source_watermarks WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.flatten().map(StorageTimestamp::from_stored))
    }

    async fn advance(&self, source_id: SourceId, candidate: StorageTimestamp) -> Result<bool, StoreError> {
        let now = StorageTimestamp::normalize(&Utc::now());
        let result = sqlx::query(
            "INSERT INTO source_watermarks (source_id, max_record_timestamp, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (source_id) DO UPDATE
                SET max_record_timestamp = EXCLUDED.max_record_timestamp,
                    updated_at = EXCLUDED.updated_at
              WHERE source_watermarks.max_record_timestamp IS NULL
                 OR source_watermarks.max_record_timestamp < EXCLUDED.max_record_timestamp",
        )
        .bind(source_id)
        .bind(candidate.as_naive())
        .bind(now.as_naive())
        .execute(&self.pool)
        .await?;

        let advanced = result.rows_affected() == 1;
        debug!(source_id = %source_id, candidate = %candidate, advanced, "watermark advance");
        Ok(advanced)
    }

    async fn reset(&self, source_id: SourceId) -> Result<(), StoreError> {
        let now = StorageTimestamp::normalize(&Utc::now());
        sqlx::query(
            "UPDATE source_watermarks SET max_record_timestamp = NULL, updated_at = $2
             WHERE source_id = $1",
        )
        .bind(source_id)
        .bind(now.as_naive())
        .execute(&self.pool)
        .await?;

        info!(source_id = %source_id, "watermark reset");
        Ok(())
    }
}

// ── In-memory ────────────────────────────────────────────────────────

/// Process-local watermark store. `set_unavailable(true)` makes every call
/// fail the way an unreachable database would.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    values: Mutex<HashMap<SourceId, StorageTimestamp>>,
    unavailable: AtomicBool,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("watermark store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, source_id: SourceId) -> Result<Option<StorageTimestamp>, StoreError> {
        self.check()?;
        Ok(self.values.lock().await.get(&source_id).copied())
    }

    async fn advance(&self, source_id: SourceId, candidate: StorageTimestamp) -> Result<bool, StoreError> {
        self.check()?;
        let mut values = self.values.lock().await;
        match values.get(&source_id) {
            Some(current) if *current >= candidate => Ok(false),
            _ => {
                values.insert(source_id, candidate);
                Ok(true)
            }
        }
    }

    async fn reset(&self, source_id: SourceId) -> Result<(), StoreError> {
        self.check()?;
        self.values.lock().await.remove(&source_id);
        Ok(())
    }
}
