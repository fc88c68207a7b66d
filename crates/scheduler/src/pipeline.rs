//! One source, one tick: decide → fetch → persist → advance.
//!
//! Every failure is turned into a [`ParseOutcome`]; nothing here returns an
//! error to the dispatcher.
//!
//! A fetch that stops above its lower bound leaves a [`ResumePoint`] in the
//! attempt log. Later ticks page on from there, and the watermark only moves
//! once a fetch reaches the bound.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use chatsync_core::{
    ErrorKind, ParseMode, ParseOutcome, PersistReport, ResumePoint, SchedulerConfig, Source, StorageTimestamp,
};
use chatsync_fetch::{FetchOutcome, RetryingFetcher};
use chatsync_store::{AttemptLog, BatchPersister, SourceRegistry, StoreError, WatermarkStore};

use crate::events::{self, topics, AssociationCreated, EventEmitter, RecordsPersisted};
use crate::metrics::IngestMetrics;
use crate::policy::ModeDecisionPolicy;

pub(crate) struct PipelineRun {
    pub mode: Option<ParseMode>,
    pub outcome: ParseOutcome,
}

impl PipelineRun {
    fn unmoded(outcome: ParseOutcome) -> Self {
        Self { mode: None, outcome }
    }

    fn moded(mode: ParseMode, outcome: ParseOutcome) -> Self {
        Self {
            mode: Some(mode),
            outcome,
        }
    }
}

pub(crate) struct SourcePipeline {
    pub config: SchedulerConfig,
    pub policy: ModeDecisionPolicy,
    pub fetcher: RetryingFetcher,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub persister: Arc<dyn BatchPersister>,
    pub registry: Arc<dyn SourceRegistry>,
    pub attempts: Arc<dyn AttemptLog>,
    pub emitter: Arc<dyn EventEmitter>,
    pub metrics: Arc<IngestMetrics>,
}

impl SourcePipeline {
    pub async fn run(&self, source: &Source, now: DateTime<Utc>) -> PipelineRun {
        if let Some(reason) = self.cooldown(source, now).await {
            debug!(source_id = %source.id, %reason, "skipping source");
            return PipelineRun::unmoded(ParseOutcome::Skipped { reason });
        }

        // Without a trustworthy watermark nothing below is safe to run.
        let watermark = match self.watermarks.get(source.id).await {
            Ok(w) => w,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "watermark store unavailable");
                return PipelineRun::unmoded(ParseOutcome::error(ErrorKind::WatermarkUnavailable, e.to_string()));
            }
        };

        let decision = self.policy.decide(source, watermark, now);
        let mode = decision.mode();
        if let Some(reason) = decision.forced_reason() {
            info!(source_id = %source.id, %reason, "forcing historical mode");
            self.metrics.record_forced(reason);
        }
        debug!(source_id = %source.id, ?decision, "mode decided");

        let resume = self.resume_point(source).await;
        if let Some(point) = resume {
            info!(source_id = %source.id, before = %point.before, "resuming unfinished fetch");
        }

        let outcome = match self.fetcher.fetch_from(source, decision.plan(), resume.map(|r| r.before)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(source_id = %source.id, mode = %mode, error = %e, "fetch failed");
                return PipelineRun::moded(mode, ParseOutcome::error(e.kind(), e.to_string()));
            }
        };
        let (fetched, stopped_early) = match outcome {
            FetchOutcome::Complete(fetched) => (fetched, None),
            FetchOutcome::Truncated { fetched, resume_before } => {
                let message = format!("page budget reached; continuing older than {resume_before}");
                (fetched, Some((None, message)))
            }
            FetchOutcome::Interrupted { fetched, error } => (fetched, Some((Some(error.kind()), error.to_string()))),
        };
        let records_fetched = fetched.records.len() as u64;

        let report = if fetched.records.is_empty() {
            PersistReport::default()
        } else {
            match self.persister.persist(source, &fetched.records).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(source_id = %source.id, mode = %mode, error = %e, "batch rolled back");
                    return PipelineRun::moded(mode, ParseOutcome::error(ErrorKind::Persistence, e.to_string()));
                }
            }
        };

        self.publish(source, mode, &report).await;

        // Newest committed timestamp across this run and the unfinished runs
        // it continues.
        let committed_max = report.max_timestamp.max(resume.map(|r| r.committed_max));

        if let Some((error_kind, message)) = stopped_early {
            let next_resume = match (fetched.oldest_id(), committed_max) {
                (Some(before), Some(committed_max)) => Some(ResumePoint { before, committed_max }),
                _ => resume,
            };
            warn!(
                source_id = %source.id,
                mode = %mode,
                persisted = report.inserted,
                resume_before = ?next_resume.map(|r| r.before),
                error = %message,
                "fetch stopped above its lower bound; watermark left in place"
            );
            return PipelineRun::moded(
                mode,
                ParseOutcome::Partial {
                    records_fetched,
                    persisted: report,
                    error_kind,
                    message,
                    resume: next_resume,
                },
            );
        }

        let watermark_advanced = match committed_max {
            Some(candidate) => match self.watermarks.advance(source.id, candidate).await {
                Ok(advanced) => advanced,
                Err(e) => {
                    warn!(source_id = %source.id, error = %e, "watermark advance failed after commit");
                    return PipelineRun::moded(mode, watermark_error(e));
                }
            },
            None => false,
        };

        if let Err(e) = self
            .registry
            .update_last_parsed_at(source.id, StorageTimestamp::normalize(&now))
            .await
        {
            warn!(source_id = %source.id, error = %e, "failed to write back last_parsed_at");
        }

        info!(
            source_id = %source.id,
            mode = %mode,
            fetched = records_fetched,
            inserted = report.inserted,
            duplicates = report.skipped_duplicates,
            watermark_advanced,
            "source parsed"
        );
        PipelineRun::moded(
            mode,
            ParseOutcome::Success {
                records_fetched,
                persisted: report,
                watermark_advanced,
            },
        )
    }

    /// `Some(reason)` if the source's last real attempt was a permanent
    /// resolution failure within the cool-down window.
    async fn cooldown(&self, source: &Source, now: DateTime<Utc>) -> Option<String> {
        let cooldown = chrono::Duration::from_std(self.config.dead_source_cooldown).ok()?;
        match self.attempts.last_unresolvable(source.id).await {
            Ok(Some(failed_at)) if now - failed_at < cooldown => Some(format!(
                "unresolvable since {}, retrying after {}",
                failed_at.to_rfc3339(),
                (failed_at + cooldown).to_rfc3339()
            )),
            Ok(_) => None,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "attempt log unavailable; not cooling down");
                None
            }
        }
    }

    async fn resume_point(&self, source: &Source) -> Option<ResumePoint> {
        match self.attempts.resume_point(source.id).await {
            Ok(point) => point,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "attempt log unavailable; fetching from the newest message");
                None
            }
        }
    }

    async fn publish(&self, source: &Source, mode: ParseMode, report: &PersistReport) {
        let timeout = self.config.emit_timeout;
        if report.inserted > 0 {
            let event = RecordsPersisted::new(source.id, mode, report);
            let key = RecordsPersisted::idempotency_key(source.id, report);
            events::emit_best_effort(self.emitter.as_ref(), timeout, topics::RECORDS_PERSISTED, &event, &key).await;
        }
        if report.associations_created > 0 {
            if let Some(tenant_id) = source.tenant_id {
                let event = AssociationCreated {
                    tenant_id,
                    source_id: source.id,
                };
                let key = event.idempotency_key();
                events::emit_best_effort(self.emitter.as_ref(), timeout, topics::ASSOCIATION_CREATED, &event, &key)
                    .await;
            }
        }
    }
}

fn watermark_error(e: StoreError) -> ParseOutcome {
    ParseOutcome::error(ErrorKind::WatermarkUnavailable, e.to_string())
}
