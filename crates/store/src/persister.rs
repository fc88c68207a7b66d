//! Idempotent, transactional persistence of one fetch batch.
//!
//! A batch is a single transaction covering the record rows, their
//! attachment/reaction/metric side rows, and any association it provisions.
//! The natural key `(source_id, external_message_id)` makes re-persisting the
//! same upstream item a counted duplicate rather than an error.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};

use chatsync_core::{Association, MessageId, PersistReport, Record, Source, SourceId, StorageTimestamp};

use crate::error::StoreError;

#[async_trait]
pub trait BatchPersister: Send + Sync {
    /// Commit `records` for `source` atomically. On error nothing from the
    /// batch is visible.
    async fn persist(&self, source: &Source, records: &[Record]) -> Result<PersistReport, StoreError>;
}

/// Max normalized `posted_at` across `records`.
fn batch_max_timestamp(records: &[Record]) -> Option<StorageTimestamp> {
    records
        .iter()
        .map(|r| StorageTimestamp::normalize(&r.posted_at))
        .max()
}

/// Whether a batch with `inserted` new rows should provision an association.
fn wants_association(source: &Source, inserted: u64) -> Option<Association> {
    if inserted == 0 || !source.active {
        return None;
    }
    source.tenant_id.map(|tenant_id| Association {
        tenant_id,
        source_id: source.id,
    })
}

// ── PostgreSQL ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PgBatchPersister {
    pool: PgPool,
}

impl PgBatchPersister {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert one record and its side rows. Returns `false` for a duplicate.
    async fn insert_record(
        tx: &mut Transaction<'_, Postgres>,
        source_id: SourceId,
        record: &Record,
        ingested_at: StorageTimestamp,
    ) -> Result<bool, StoreError> {
        let posted_at = StorageTimestamp::normalize(&record.posted_at);
        let row_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO records (source_id, external_message_id, posted_at, author, body, ingested_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (source_id, external_message_id) DO NOTHING
             RETURNING id",
        )
        .bind(source_id)
        .bind(record.external_message_id.0)
        .bind(posted_at.as_naive())
        .bind(&record.author)
        .bind(&record.text)
        .bind(ingested_at.as_naive())
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row_id) = row_id else {
            return Ok(false);
        };

        for attachment in &record.attachments {
            sqlx::query(
                "INSERT INTO record_attachments (record_id, kind, url, file_name, size_bytes)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(row_id)
            .bind(&attachment.kind)
            .bind(&attachment.url)
            .bind(&attachment.file_name)
            .bind(attachment.size_bytes)
            .execute(&mut **tx)
            .await?;
        }

        for reaction in &record.reactions {
            sqlx::query(
                "INSERT INTO record_reactions (record_id, emoji, count) VALUES ($1, $2, $3)
                 ON CONFLICT (record_id, emoji) DO UPDATE SET count = EXCLUDED.count",
            )
            .bind(row_id)
            .bind(&reaction.emoji)
            .bind(reaction.count)
            .execute(&mut **tx)
            .await?;
        }

        if record.views.is_some() {
            sqlx::query("INSERT INTO record_metrics (record_id, views, observed_at) VALUES ($1, $2, $3)")
                .bind(row_id)
                .bind(record.views)
                .bind(ingested_at.as_naive())
                .execute(&mut **tx)
                .await?;
        }

        Ok(true)
    }
}

#[async_trait]
impl BatchPersister for PgBatchPersister {
    async fn persist(&self, source: &Source, records: &[Record]) -> Result<PersistReport, StoreError> {
        let ingested_at = StorageTimestamp::normalize(&Utc::now());
        let mut report = PersistReport {
            max_timestamp: batch_max_timestamp(records),
            ..PersistReport::default()
        };

        let mut tx = self.pool.begin().await?;

        for record in records {
            if Self::insert_record(&mut tx, source.id, record, ingested_at).await? {
                report.inserted += 1;
            } else {
                report.skipped_duplicates += 1;
            }
        }

        if let Some(assoc) = wants_association(source, report.inserted) {
            let result = sqlx::query(
                "INSERT INTO source_associations (tenant_id, source_id, created_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (tenant_id, source_id) DO NOTHING",
            )
            .bind(assoc.tenant_id)
            .bind(assoc.source_id)
            .bind(ingested_at.as_naive())
            .execute(&mut *tx)
            .await?;
            report.associations_created = result.rows_affected();
        }

        tx.commit().await?;

        if report.associations_created > 0 {
            info!(source_id = %source.id, "association provisioned");
        }
        debug!(
            source_id = %source.id,
            inserted = report.inserted,
            duplicates = report.skipped_duplicates,
            "batch committed"
        );
        Ok(report)
    }
}

// ── In-memory ────────────────────────────────────────────────────────

/// A committed record row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub source_id: SourceId,
    pub external_message_id: MessageId,
    pub posted_at: StorageTimestamp,
    pub author: Option<String>,
    pub body: String,
    pub attachments: usize,
    pub reactions: usize,
    pub views: Option<i64>,
}

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<(SourceId, MessageId), StoredRecord>,
    associations: HashSet<Association>,
}

/// Process-local persister with the same idempotency and all-or-nothing
/// behavior as the PostgreSQL one. `reject_message` injects a failure for a
/// given message id to exercise rollback.
#[derive(Debug, Default)]
pub struct MemoryBatchPersister {
    tables: Mutex<Tables>,
    rejected: Mutex<HashSet<MessageId>>,
}

impl MemoryBatchPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any batch containing `id` until cleared.
    pub async fn reject_message(&self, id: MessageId) {
        self.rejected.lock().await.insert(id);
    }

    pub async fn clear_rejections(&self) {
        self.rejected.lock().await.clear();
    }

    pub async fn record_count(&self, source_id: SourceId) -> usize {
        self.tables
            .lock()
            .await
            .records
            .keys()
            .filter(|(sid, _)| *sid == source_id)
            .count()
    }

    pub async fn get(&self, source_id: SourceId, id: MessageId) -> Option<StoredRecord> {
        self.tables.lock().await.records.get(&(source_id, id)).cloned()
    }

    pub async fn associations(&self) -> Vec<Association> {
        self.tables.lock().await.associations.iter().copied().collect()
    }
}

#[async_trait]
impl BatchPersister for MemoryBatchPersister {
    async fn persist(&self, source: &Source, records: &[Record]) -> Result<PersistReport, StoreError> {
        let rejected = self.rejected.lock().await.clone();
        let mut tables = self.tables.lock().await;

        // Stage first; only apply once the whole batch is known to succeed.
        let mut staged: HashMap<(SourceId, MessageId), StoredRecord> = HashMap::new();
        let mut report = PersistReport {
            max_timestamp: batch_max_timestamp(records),
            ..PersistReport::default()
        };

        for record in records {
            let key = (source.id, record.external_message_id);
            if rejected.contains(&record.external_message_id) {
                return Err(StoreError::Rejected {
                    message_id: record.external_message_id,
                    reason: "injected failure".into(),
                });
            }
            if tables.records.contains_key(&key) || staged.contains_key(&key) {
                report.skipped_duplicates += 1;
                continue;
            }
            staged.insert(
                key,
                StoredRecord {
                    source_id: source.id,
                    external_message_id: record.external_message_id,
                    posted_at: StorageTimestamp::normalize(&record.posted_at),
                    author: record.author.clone(),
                    body: record.text.clone(),
                    attachments: record.attachments.len(),
                    reactions: record.reactions.len(),
                    views: record.views,
                },
            );
            report.inserted += 1;
        }

        if let Some(assoc) = wants_association(source, report.inserted) {
            if tables.associations.insert(assoc) {
                report.associations_created = 1;
            }
        }
        tables.records.extend(staged);

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use chatsync_core::{Attachment, Reaction};
    use uuid::Uuid;

    fn record(id: i64, minute: u32) -> Record {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        Record::new(id, tz.with_ymd_and_hms(2024, 4, 1, 12, minute, 0).unwrap(), format!("msg {id}"))
    }

    fn batch() -> Vec<Record> {
        (1..=5).map(|i| record(i, i as u32)).collect()
    }

    #[tokio::test]
    async fn second_identical_batch_inserts_nothing() {
        let persister = MemoryBatchPersister::new();
        let source = Source::new(Uuid::new_v4(), "chan");

        let first = persister.persist(&source, &batch()).await.unwrap();
        let second = persister.persist(&source, &batch()).await.unwrap();

        assert_eq!(first.inserted, 5);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped_duplicates, 5);
        assert_eq!(first.max_timestamp, second.max_timestamp);
        assert_eq!(persister.record_count(source.id).await, 5);
    }

    #[tokio::test]
    async fn duplicates_inside_one_batch_are_skipped() {
        let persister = MemoryBatchPersister::new();
        let source = Source::new(Uuid::new_v4(), "chan");

        let report = persister
            .persist(&source, &[record(1, 1), record(1, 1), record(2, 2)])
            .await
            .unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped_duplicates, 1);
    }

    #[tokio::test]
    async fn same_message_id_in_other_source_is_not_a_duplicate() {
        let persister = MemoryBatchPersister::new();
        let a = Source::new(Uuid::new_v4(), "a");
        let b = Source::new(Uuid::new_v4(), "b");

        persister.persist(&a, &[record(1, 1)]).await.unwrap();
        let report = persister.persist(&b, &[record(1, 1)]).await.unwrap();

        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn failure_rolls_back_entire_batch() {
        let persister = MemoryBatchPersister::new();
        let source = Source::new(Uuid::new_v4(), "chan").with_tenant(Uuid::new_v4());
        persister.reject_message(MessageId(4)).await;

        let err = persister.persist(&source, &batch()).await.unwrap_err();

        assert!(matches!(err, StoreError::Rejected { message_id: MessageId(4), .. }));
        assert_eq!(persister.record_count(source.id).await, 0);
        assert!(persister.associations().await.is_empty());

        persister.clear_rejections().await;
        let report = persister.persist(&source, &batch()).await.unwrap();
        assert_eq!(report.inserted, 5);
    }

    #[tokio::test]
    async fn timestamps_are_stored_normalized() {
        let persister = MemoryBatchPersister::new();
        let source = Source::new(Uuid::new_v4(), "chan");

        let report = persister.persist(&source, &[record(7, 30)]).await.unwrap();

        let stored = persister.get(source.id, MessageId(7)).await.unwrap();
        assert_eq!(stored.posted_at.as_naive().to_string(), "2024-04-01 10:30:00");
        assert_eq!(report.max_timestamp, Some(stored.posted_at));
    }

    #[tokio::test]
    async fn association_created_once_for_active_source() {
        let persister = MemoryBatchPersister::new();
        let tenant = Uuid::new_v4();
        let source = Source::new(Uuid::new_v4(), "chan").with_tenant(tenant);

        let first = persister.persist(&source, &[record(1, 1)]).await.unwrap();
        let second = persister.persist(&source, &[record(2, 2)]).await.unwrap();

        assert_eq!(first.associations_created, 1);
        assert_eq!(second.associations_created, 0);
        assert_eq!(
            persister.associations().await,
            vec![Association { tenant_id: tenant, source_id: source.id }]
        );
    }

    #[tokio::test]
    async fn inactive_source_never_gets_association() {
        let persister = MemoryBatchPersister::new();
        let source = Source::new(Uuid::new_v4(), "chan")
            .with_tenant(Uuid::new_v4())
            .inactive();

        let report = persister.persist(&source, &batch()).await.unwrap();

        assert_eq!(report.inserted, 5);
        assert_eq!(report.associations_created, 0);
        assert!(persister.associations().await.is_empty());
    }

    #[tokio::test]
    async fn all_duplicate_batch_provisions_nothing() {
        let persister = MemoryBatchPersister::new();
        let plain = Source::new(Uuid::new_v4(), "chan");
        persister.persist(&plain, &[record(1, 1)]).await.unwrap();

        let with_tenant = plain.clone().with_tenant(Uuid::new_v4());
        let report = persister.persist(&with_tenant, &[record(1, 1)]).await.unwrap();

        assert_eq!(report.inserted, 0);
        assert_eq!(report.associations_created, 0);
    }

    #[tokio::test]
    async fn side_tables_are_counted() {
        let persister = MemoryBatchPersister::new();
        let source = Source::new(Uuid::new_v4(), "chan");
        let mut rec = record(9, 9);
        rec.attachments.push(Attachment {
            kind: "photo".into(),
            url: Some("https://cdn.example/p.jpg".into()),
            file_name: None,
            size_bytes: Some(2048),
        });
        rec.reactions.push(Reaction { emoji: "+1".into(), count: 3 });
        rec.views = Some(120);

        persister.persist(&source, &[rec]).await.unwrap();

        let stored = persister.get(source.id, MessageId(9)).await.unwrap();
        assert_eq!(stored.attachments, 1);
        assert_eq!(stored.reactions, 1);
        assert_eq!(stored.views, Some(120));
    }

    #[test]
    fn empty_batch_has_no_max() {
        assert_eq!(batch_max_timestamp(&[]), None);
    }
}
