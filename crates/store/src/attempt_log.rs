//! Per-source attempt records.
//!
//! Every [`ParseAttempt`] is recorded. The log also answers two questions
//! about a source without touching the record watermark: whether its most
//! recent real attempt ended in a permanent resolution failure (cool-down),
//! and where an unfinished fetch should continue (resume point).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::PgPool;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use chatsync_core::{AttemptStatus, ErrorKind, ParseAttempt, ParseOutcome, ResumePoint, SourceId, StorageTimestamp};

use crate::error::StoreError;

#[async_trait]
pub trait AttemptLog: Send + Sync {
    async fn record(&self, attempt: &ParseAttempt) -> Result<(), StoreError>;

    /// Start time of the source's latest non-skipped attempt, if that attempt
    /// failed with [`ErrorKind::PermanentResolution`].
    async fn last_unresolvable(&self, source_id: SourceId) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Resume point of the latest partial attempt, unless a successful
    /// attempt came after it. Failed and skipped attempts leave it in place.
    async fn resume_point(&self, source_id: SourceId) -> Result<Option<ResumePoint>, StoreError>;
}

/// Per-source state derived from a stream of attempts.
#[derive(Debug, Default)]
struct AttemptIndex {
    unresolvable: HashMap<SourceId, DateTime<Utc>>,
    resume: HashMap<SourceId, ResumePoint>,
}

impl AttemptIndex {
    fn observe(&mut self, attempt: &ParseAttempt) {
        if attempt.status() == AttemptStatus::Skipped {
            return;
        }
        if attempt.outcome.error_kind() == Some(ErrorKind::PermanentResolution) {
            self.unresolvable.insert(attempt.source_id, attempt.started_at);
        } else {
            self.unresolvable.remove(&attempt.source_id);
        }

        match &attempt.outcome {
            ParseOutcome::Success { .. } => {
                self.resume.remove(&attempt.source_id);
            }
            ParseOutcome::Partial { resume: Some(point), .. } => {
                self.resume.insert(attempt.source_id, *point);
            }
            _ => {}
        }
    }

    fn unresolvable(&self, source_id: SourceId) -> Option<DateTime<Utc>> {
        self.unresolvable.get(&source_id).copied()
    }

    fn resume(&self, source_id: SourceId) -> Option<ResumePoint> {
        self.resume.get(&source_id).copied()
    }
}

// ── JSONL file ───────────────────────────────────────────────────────

/// Appends one JSON line per attempt, e.g. `data/ingestion/attempts.jsonl`.
///
/// On open, existing lines are replayed to rebuild the cool-down index;
/// unreadable lines are skipped with a warning.
#[derive(Debug)]
pub struct JsonlAttemptLog {
    path: PathBuf,
    index: Mutex<AttemptIndex>,
}

impl JsonlAttemptLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut index = AttemptIndex::default();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for (line_no, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ParseAttempt>(line) {
                        Ok(attempt) => index.observe(&attempt),
                        Err(e) => warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "skipping unreadable attempt log line"
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path,
            index: Mutex::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AttemptLog for JsonlAttemptLog {
    async fn record(&self, attempt: &ParseAttempt) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(attempt)?;
        line.push('\n');

        // Held across the write so concurrent records never interleave.
        let mut index = self.index.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        index.observe(attempt);
        Ok(())
    }

    async fn last_unresolvable(&self, source_id: SourceId) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.index.lock().await.unresolvable(source_id))
    }

    async fn resume_point(&self, source_id: SourceId) -> Result<Option<ResumePoint>, StoreError> {
        Ok(self.index.lock().await.resume(source_id))
    }
}

// ── PostgreSQL ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PgAttemptLog {
    pool: PgPool,
}

impl PgAttemptLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttemptLog for PgAttemptLog {
    async fn record(&self, attempt: &ParseAttempt) -> Result<(), StoreError> {
        let outcome = serde_json::to_value(&attempt.outcome)?;
        sqlx::query(
            "INSERT INTO parse_attempts
                (source_id, mode, status, error_kind, started_at, duration_ms, outcome_json)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(attempt.source_id)
        .bind(attempt.mode.map(|m| m.as_str()))
        .bind(attempt.status().as_str())
        .bind(attempt.outcome.error_kind().map(|k| k.as_str()))
        .bind(StorageTimestamp::normalize(&attempt.started_at).as_naive())
        .bind(i64::try_from(attempt.duration.as_millis()).unwrap_or(i64::MAX))
        .bind(outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_unresolvable(&self, source_id: SourceId) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest = sqlx::query_as::<_, (NaiveDateTime, Option<String>)>(
            "SELECT started_at, error_kind FROM parse_attempts
             WHERE source_id = $1 AND status <> 'skipped'
             ORDER BY started_at DESC
             LIMIT 1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(latest.and_then(|(started_at, kind)| {
            (kind.as_deref() == Some(ErrorKind::PermanentResolution.as_str()))
                .then(|| StorageTimestamp::from_stored(started_at).to_utc())
        }))
    }

    async fn resume_point(&self, source_id: SourceId) -> Result<Option<ResumePoint>, StoreError> {
        let latest = sqlx::query_as::<_, (serde_json::Value,)>(
            "SELECT outcome_json FROM parse_attempts
             WHERE source_id = $1
               AND (status = 'success'
                    OR (status = 'partial' AND jsonb_typeof(outcome_json -> 'resume') = 'object'))
             ORDER BY started_at DESC, id DESC
             LIMIT 1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        match latest {
            Some((outcome,)) => Ok(serde_json::from_value::<ParseOutcome>(outcome)?.resume()),
            None => Ok(None),
        }
    }
}

// ── In-memory ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryAttemptLog {
    attempts: Mutex<Vec<ParseAttempt>>,
    index: Mutex<AttemptIndex>,
}

impl MemoryAttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attempts(&self) -> Vec<ParseAttempt> {
        self.attempts.lock().await.clone()
    }

    pub async fn attempts_for(&self, source_id: SourceId) -> Vec<ParseAttempt> {
        self.attempts
            .lock()
            .await
            .iter()
            .filter(|a| a.source_id == source_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AttemptLog for MemoryAttemptLog {
    async fn record(&self, attempt: &ParseAttempt) -> Result<(), StoreError> {
        self.index.lock().await.observe(attempt);
        self.attempts.lock().await.push(attempt.clone());
        Ok(())
    }

    async fn last_unresolvable(&self, source_id: SourceId) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.index.lock().await.unresolvable(source_id))
    }

    async fn resume_point(&self, source_id: SourceId) -> Result<Option<ResumePoint>, StoreError> {
        Ok(self.index.lock().await.resume(source_id))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use chatsync_core::{MessageId, ParseMode, PersistReport};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn attempt(source_id: SourceId, minute: u32, outcome: ParseOutcome) -> ParseAttempt {
        ParseAttempt {
            source_id,
            mode: Some(ParseMode::Incremental),
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, minute, 0).unwrap(),
            duration: Duration::from_millis(10),
            outcome,
        }
    }

    fn unresolvable() -> ParseOutcome {
        ParseOutcome::error(ErrorKind::PermanentResolution, "no such channel")
    }

    fn success() -> ParseOutcome {
        ParseOutcome::Success {
            records_fetched: 0,
            persisted: PersistReport::default(),
            watermark_advanced: false,
        }
    }

    #[tokio::test]
    async fn latest_permanent_failure_is_tracked_until_success() {
        let log = MemoryAttemptLog::new();
        let id = Uuid::new_v4();

        log.record(&attempt(id, 1, unresolvable())).await.unwrap();
        let first = log.last_unresolvable(id).await.unwrap();
        assert_eq!(first, Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 1, 0).unwrap()));

        log.record(&attempt(id, 2, ParseOutcome::Skipped { reason: "cooldown".into() }))
            .await
            .unwrap();
        assert_eq!(log.last_unresolvable(id).await.unwrap(), first);

        log.record(&attempt(id, 3, success())).await.unwrap();
        assert_eq!(log.last_unresolvable(id).await.unwrap(), None);
        assert_eq!(log.attempts_for(id).await.len(), 3);
    }

    #[tokio::test]
    async fn transient_error_clears_cooldown() {
        let log = MemoryAttemptLog::new();
        let id = Uuid::new_v4();

        log.record(&attempt(id, 1, unresolvable())).await.unwrap();
        log.record(&attempt(id, 2, ParseOutcome::error(ErrorKind::TransientFetch, "reset")))
            .await
            .unwrap();

        assert_eq!(log.last_unresolvable(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn jsonl_log_appends_and_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingestion").join("attempts.jsonl");
        let id = Uuid::new_v4();

        {
            let log = JsonlAttemptLog::open(&path).await.unwrap();
            log.record(&attempt(id, 1, success())).await.unwrap();
            log.record(&attempt(id, 2, unresolvable())).await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("permanent_resolution"));

        let reopened = JsonlAttemptLog::open(&path).await.unwrap();
        assert_eq!(
            reopened.last_unresolvable(id).await.unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 2, 0).unwrap())
        );
    }

    fn budget_partial(before: i64) -> ParseOutcome {
        ParseOutcome::Partial {
            records_fetched: 20,
            persisted: PersistReport::default(),
            error_kind: None,
            message: "page budget reached".into(),
            resume: Some(ResumePoint {
                before: MessageId(before),
                committed_max: StorageTimestamp::normalize(&Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()),
            }),
        }
    }

    #[tokio::test]
    async fn resume_point_survives_failures_until_success() {
        let log = MemoryAttemptLog::new();
        let id = Uuid::new_v4();

        log.record(&attempt(id, 1, budget_partial(31))).await.unwrap();
        log.record(&attempt(id, 2, ParseOutcome::error(ErrorKind::TransientFetch, "reset")))
            .await
            .unwrap();
        assert_eq!(log.resume_point(id).await.unwrap().map(|r| r.before), Some(MessageId(31)));

        log.record(&attempt(id, 3, budget_partial(12))).await.unwrap();
        assert_eq!(log.resume_point(id).await.unwrap().map(|r| r.before), Some(MessageId(12)));

        log.record(&attempt(id, 4, success())).await.unwrap();
        assert_eq!(log.resume_point(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn jsonl_log_replays_resume_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attempts.jsonl");
        let id = Uuid::new_v4();

        JsonlAttemptLog::open(&path)
            .await
            .unwrap()
            .record(&attempt(id, 1, budget_partial(31)))
            .await
            .unwrap();

        let reopened = JsonlAttemptLog::open(&path).await.unwrap();
        assert_eq!(reopened.resume_point(id).await.unwrap().map(|r| r.before), Some(MessageId(31)));
    }

    #[tokio::test]
    async fn jsonl_log_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attempts.jsonl");
        std::fs::write(&path, "not json\n\n").unwrap();

        let log = JsonlAttemptLog::open(&path).await.unwrap();

        assert_eq!(log.last_unresolvable(Uuid::new_v4()).await.unwrap(), None);
        assert_eq!(log.path(), path.as_path());
    }
}
