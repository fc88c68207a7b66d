//! The periodic, cluster-wide ingestion tick.
//!
//! ```text
//! idle → lock_attempt ─┬─ locked → running → releasing → idle
//!                      └─ not locked → idle
//! ```
//!
//! While running, every active source goes through [`SourcePipeline`] on a
//! bounded worker pool. A failing or panicking source becomes an `error`
//! attempt; it never stops the others.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use chatsync_core::{
    AttemptStatus, Clock, ErrorKind, ParseAttempt, ParseOutcome, SchedulerConfig, Source, SourceId,
};
use chatsync_fetch::{MessageSource, RetryingFetcher};
use chatsync_store::{AttemptLog, BatchPersister, DistributedLock, SourceRegistry, StoreError, WatermarkStore};

use crate::events::{self, topics, EventEmitter, TickCompleted};
use crate::metrics::{IngestMetrics, LockResult};
use crate::pipeline::SourcePipeline;
use crate::policy::ModeDecisionPolicy;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cluster lock backend failed: {0}")]
    Lock(#[source] StoreError),

    #[error("source registry failed: {0}")]
    Registry(#[source] StoreError),
}

/// Everything the scheduler talks to, wired once at startup.
pub struct SchedulerDeps {
    pub registry: Arc<dyn SourceRegistry>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub lock: Arc<dyn DistributedLock>,
    pub source: Arc<dyn MessageSource>,
    pub persister: Arc<dyn BatchPersister>,
    pub attempts: Arc<dyn AttemptLog>,
    pub emitter: Arc<dyn EventEmitter>,
    pub clock: Arc<dyn Clock>,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another instance holds the lock.
    NotLocked,
    Completed(TickReport),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub attempts: Vec<ParseAttempt>,
}

impl TickReport {
    pub fn attempt_for(&self, source_id: SourceId) -> Option<&ParseAttempt> {
        self.attempts.iter().find(|a| a.source_id == source_id)
    }

    pub fn count(&self, status: AttemptStatus) -> usize {
        self.attempts.iter().filter(|a| a.status() == status).count()
    }

    pub fn records_persisted(&self) -> u64 {
        self.attempts.iter().map(|a| a.outcome.records_persisted()).sum()
    }
}

impl TickOutcome {
    pub fn report(&self) -> Option<&TickReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::NotLocked => None,
        }
    }
}

pub struct DistributedScheduler {
    config: SchedulerConfig,
    owner_id: String,
    registry: Arc<dyn SourceRegistry>,
    watermarks: Arc<dyn WatermarkStore>,
    lock: Arc<dyn DistributedLock>,
    attempts: Arc<dyn AttemptLog>,
    emitter: Arc<dyn EventEmitter>,
    clock: Arc<dyn Clock>,
    metrics: Arc<IngestMetrics>,
    pipeline: Arc<SourcePipeline>,
}

impl DistributedScheduler {
    pub fn new(config: SchedulerConfig, owner_id: impl Into<String>, deps: SchedulerDeps) -> Self {
        let metrics = Arc::new(IngestMetrics::new());
        let fetcher = RetryingFetcher::new(deps.source, &config).with_observer(metrics.clone());

        let pipeline = Arc::new(SourcePipeline {
            config: config.clone(),
            policy: ModeDecisionPolicy::from_config(&config),
            fetcher,
            watermarks: deps.watermarks.clone(),
            persister: deps.persister,
            registry: deps.registry.clone(),
            attempts: deps.attempts.clone(),
            emitter: deps.emitter.clone(),
            metrics: metrics.clone(),
        });

        Self {
            config,
            owner_id: owner_id.into(),
            registry: deps.registry,
            watermarks: deps.watermarks,
            lock: deps.lock,
            attempts: deps.attempts,
            emitter: deps.emitter,
            clock: deps.clock,
            metrics,
            pipeline,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Loop until `shutdown` is notified. The first tick runs immediately.
    ///
    /// A tick in progress is allowed to finish; shutdown is observed between
    /// ticks.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            owner_id = %self.owner_id,
            interval_secs = self.config.tick_interval.as_secs(),
            max_concurrency = self.config.max_concurrency,
            "ingestion scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_tick().await {
                        error!(error = %e, "tick aborted");
                    }
                }
                _ = shutdown.notified() => {
                    info!(owner_id = %self.owner_id, "ingestion scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One tick. Returns `NotLocked` without doing anything if another
    /// instance owns the lock.
    pub async fn run_tick(&self) -> Result<TickOutcome, SchedulerError> {
        let key = self.config.lock_key.as_str();
        match self.lock.acquire(key, &self.owner_id, self.config.lock_ttl).await {
            Ok(true) => self.metrics.record_lock(LockResult::Acquired),
            Ok(false) => {
                self.metrics.record_lock(LockResult::Contended);
                debug!(owner_id = %self.owner_id, "tick owned by another instance");
                return Ok(TickOutcome::NotLocked);
            }
            Err(e) => {
                self.metrics.record_lock(LockResult::Error);
                return Err(SchedulerError::Lock(e));
            }
        }

        let result = self.run_locked().await;

        match self.lock.release(key, &self.owner_id).await {
            Ok(true) => {}
            Ok(false) => warn!(owner_id = %self.owner_id, "lock expired before release; another instance may own it"),
            Err(e) => warn!(owner_id = %self.owner_id, error = %e, "failed to release lock; it will expire"),
        }

        result.map(TickOutcome::Completed)
    }

    async fn run_locked(&self) -> Result<TickReport, SchedulerError> {
        let started_at = self.clock.now();
        let sources = self.registry.list_active_sources().await.map_err(SchedulerError::Registry)?;
        info!(owner_id = %self.owner_id, sources = sources.len(), "tick started");

        let source_ids: Vec<SourceId> = sources.iter().map(|s| s.id).collect();
        let attempts = self.dispatch(sources, started_at).await;

        for attempt in &attempts {
            self.metrics.record_attempt(attempt.mode, attempt.status());
            if let Err(e) = self.attempts.record(attempt).await {
                warn!(source_id = %attempt.source_id, error = %e, "failed to record attempt");
            }
        }

        self.refresh_watermark_gauges(&source_ids).await;
        let finished_at = self.clock.now();
        self.metrics.record_tick_success(finished_at);

        let report = TickReport { started_at, attempts };
        let summary = TickCompleted {
            owner_id: self.owner_id.clone(),
            started_at,
            sources: report.attempts.len(),
            succeeded: report.count(AttemptStatus::Success),
            partial: report.count(AttemptStatus::Partial),
            failed: report.count(AttemptStatus::Error),
            skipped: report.count(AttemptStatus::Skipped),
            records_persisted: report.records_persisted(),
        };
        info!(
            owner_id = %self.owner_id,
            sources = summary.sources,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            skipped = summary.skipped,
            persisted = summary.records_persisted,
            "tick completed"
        );
        let key = summary.idempotency_key();
        events::emit_best_effort(
            self.emitter.as_ref(),
            self.config.emit_timeout,
            topics::TICK_COMPLETED,
            &summary,
            &key,
        )
        .await;

        Ok(report)
    }

    /// Run every source through the pipeline, at most `max_concurrency` at a
    /// time. Always returns one attempt per source.
    async fn dispatch(&self, sources: Vec<Source>, now: DateTime<Utc>) -> Vec<ParseAttempt> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut attempts = Vec::with_capacity(sources.len());

        for source in sources {
            let source_id = source.id;
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                attempts.push(internal_attempt(source_id, now, "worker pool closed".into()));
                continue;
            };
            let pipeline = self.pipeline.clone();
            let span = info_span!("source", source_id = %source_id);

            set.spawn(
                async move {
                    let _permit = permit;
                    let started = tokio::time::Instant::now();
                    let run = AssertUnwindSafe(pipeline.run(&source, now)).catch_unwind().await;
                    let (mode, outcome) = match run {
                        Ok(run) => (run.mode, run.outcome),
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            error!(error = %message, "source pipeline panicked");
                            (None, ParseOutcome::error(ErrorKind::Internal, message))
                        }
                    };
                    ParseAttempt {
                        source_id,
                        mode,
                        started_at: now,
                        duration: started.elapsed(),
                        outcome,
                    }
                }
                .instrument(span),
            );
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(attempt) => attempts.push(attempt),
                // Panics are caught inside the task; this is cancellation only.
                Err(e) => warn!(error = %e, "source task did not complete"),
            }
        }
        attempts
    }

    async fn refresh_watermark_gauges(&self, source_ids: &[SourceId]) {
        let now = self.clock.now();
        for &source_id in source_ids {
            match self.watermarks.get(source_id).await {
                Ok(Some(watermark)) => self.metrics.set_watermark_age(source_id, now - watermark.to_utc()),
                Ok(None) => self.metrics.clear_watermark_age(source_id),
                Err(e) => {
                    debug!(source_id = %source_id, error = %e, "watermark gauge not refreshed");
                }
            }
        }
    }

    /// Administrative clear of one source's watermark. The next tick runs that
    /// source in historical mode.
    pub async fn reset_watermark(&self, source_id: SourceId) -> Result<(), StoreError> {
        self.watermarks.reset(source_id).await?;
        info!(source_id = %source_id, "watermark reset");
        Ok(())
    }
}

fn internal_attempt(source_id: SourceId, now: DateTime<Utc>, message: String) -> ParseAttempt {
    ParseAttempt {
        source_id,
        mode: None,
        started_at: now,
        duration: Duration::ZERO,
        outcome: ParseOutcome::error(ErrorKind::Internal, message),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}
