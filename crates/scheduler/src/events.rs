//! Downstream publish interface.
//!
//! Delivery is at-least-once: consumers dedupe on the idempotency key. From
//! the scheduler's side every emit is fire-and-forget, bounded by a timeout,
//! and a failure is only logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use chatsync_core::{ParseMode, PersistReport, SourceId};

pub mod topics {
    /// A batch committed at least one new record.
    pub const RECORDS_PERSISTED: &str = "chatsync.records.persisted";

    /// A tenant gained access to a source.
    pub const ASSOCIATION_CREATED: &str = "chatsync.association.created";

    /// A tick finished while holding the cluster lock.
    pub const TICK_COMPLETED: &str = "chatsync.tick.completed";
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("event channel closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("publish failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, topic: &str, payload: serde_json::Value, idempotency_key: &str) -> Result<(), EmitError>;
}

#[async_trait]
impl<T: EventEmitter + ?Sized> EventEmitter for Arc<T> {
    async fn emit(&self, topic: &str, payload: serde_json::Value, idempotency_key: &str) -> Result<(), EmitError> {
        (**self).emit(topic, payload, idempotency_key).await
    }
}

// ── Payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordsPersisted {
    pub source_id: SourceId,
    pub mode: ParseMode,
    pub inserted: u64,
    pub skipped_duplicates: u64,
    pub max_timestamp: Option<String>,
}

impl RecordsPersisted {
    pub fn new(source_id: SourceId, mode: ParseMode, report: &PersistReport) -> Self {
        Self {
            source_id,
            mode,
            inserted: report.inserted,
            skipped_duplicates: report.skipped_duplicates,
            max_timestamp: report.max_timestamp.map(|t| t.to_string()),
        }
    }

    /// `"{source_id}:{max_timestamp_micros}"`, stable across refetches of
    /// the same batch.
    pub fn idempotency_key(source_id: SourceId, report: &PersistReport) -> String {
        let micros = report.max_timestamp.map_or(0, |t| t.timestamp_micros());
        format!("{source_id}:{micros}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationCreated {
    pub tenant_id: uuid::Uuid,
    pub source_id: SourceId,
}

impl AssociationCreated {
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.tenant_id, self.source_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickCompleted {
    pub owner_id: String,
    pub started_at: DateTime<Utc>,
    pub sources: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub records_persisted: u64,
}

impl TickCompleted {
    pub fn idempotency_key(&self) -> String {
        format!("tick:{}:{}", self.owner_id, self.started_at.timestamp_micros())
    }
}

/// Emit with a timeout. Never fails the caller.
pub async fn emit_best_effort<T: Serialize>(
    emitter: &dyn EventEmitter,
    timeout: Duration,
    topic: &str,
    event: &T,
    idempotency_key: &str,
) {
    let payload = match serde_json::to_value(event) {
        Ok(v) => v,
        Err(e) => {
            warn!(topic = %topic, error = %e, "failed to encode event");
            return;
        }
    };

    match tokio::time::timeout(timeout, emitter.emit(topic, payload, idempotency_key)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(topic = %topic, error = %e, "failed to emit event");
        }
        Err(_) => {
            warn!(topic = %topic, "event emit timed out");
        }
    }
}

// ── Emitters ─────────────────────────────────────────────────────────

/// Logs every event. Used when no downstream bus is configured.
#[derive(Debug, Default)]
pub struct TracingEmitter;

#[async_trait]
impl EventEmitter for TracingEmitter {
    async fn emit(&self, topic: &str, payload: serde_json::Value, idempotency_key: &str) -> Result<(), EmitError> {
        info!(topic = %topic, key = %idempotency_key, payload = %payload, "event");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    pub topic: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<EmittedEvent>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EmittedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventEmitter for ChannelEmitter {
    async fn emit(&self, topic: &str, payload: serde_json::Value, idempotency_key: &str) -> Result<(), EmitError> {
        self.tx
            .send(EmittedEvent {
                topic: topic.to_string(),
                payload,
                idempotency_key: idempotency_key.to_string(),
            })
            .map_err(|_| EmitError::Closed)
    }
}
