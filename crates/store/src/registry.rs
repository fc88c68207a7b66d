//! Read access to the external source registry, plus the single write-back
//! the scheduler is allowed (`last_parsed_at`).

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use chatsync_core::{Source, SourceId, StorageTimestamp};

use crate::error::StoreError;

#[async_trait]
pub trait SourceRegistry: Send + Sync {
    async fn list_active_sources(&self) -> Result<Vec<Source>, StoreError>;

    async fn update_last_parsed_at(&self, source_id: SourceId, at: StorageTimestamp) -> Result<(), StoreError>;
}

// ── PostgreSQL ───────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct SourceRow {
    id: Uuid,
    external_identity: Option<String>,
    active: bool,
    last_parsed_at: Option<NaiveDateTime>,
    tenant_id: Option<Uuid>,
}

impl From<SourceRow> for Source {
    fn from(row: SourceRow) -> Self {
        Self {
            id: row.id,
            external_identity: row.external_identity,
            active: row.active,
            last_parsed_at: row.last_parsed_at.map(|ts| StorageTimestamp::from_stored(ts).to_utc()),
            tenant_id: row.tenant_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgSourceRegistry {
    pool: PgPool,
}

impl PgSourceRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceRegistry for PgSourceRegistry {
    async fn list_active_sources(&self) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query_as::<_, SourceRow>(
            "SELECT id, external_identity, active, last_parsed_at, tenant_id
             FROM sources
             WHERE active
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Source::from).collect())
    }

    async fn update_last_parsed_at(&self, source_id: SourceId, at: StorageTimestamp) -> Result<(), StoreError> {
        sqlx::query("UPDATE sources SET last_parsed_at = $2 WHERE id = $1")
            .bind(source_id)
            .bind(at.as_naive())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ── In-memory ────────────────────────────────────────────────────────

/// Registry backed by a `Vec`, in insertion order.
#[derive(Debug, Default)]
pub struct MemorySourceRegistry {
    sources: Mutex<Vec<Source>>,
}

impl MemorySourceRegistry {
    pub fn new(sources: Vec<Source>) -> Self {
        Self {
            sources: Mutex::new(sources),
        }
    }

    pub async fn get(&self, source_id: SourceId) -> Option<Source> {
        self.sources
            .lock()
            .await
            .iter()
            .find(|s| s.id == source_id)
            .cloned()
    }
}

#[async_trait]
impl SourceRegistry for MemorySourceRegistry {
    async fn list_active_sources(&self) -> Result<Vec<Source>, StoreError> {
        Ok(self
            .sources
            .lock()
            .await
            .iter()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn update_last_parsed_at(&self, source_id: SourceId, at: StorageTimestamp) -> Result<(), StoreError> {
        if let Some(source) = self.sources.lock().await.iter_mut().find(|s| s.id == source_id) {
            source.last_parsed_at = Some(at.to_utc());
        }
        Ok(())
    }
}
