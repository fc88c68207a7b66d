//! Ingestion metrics.
//!
//! Counters and gauges live behind one mutex and are cheap to update from
//! many concurrent source pipelines. [`IngestMetrics::snapshot`] gives a
//! serializable copy for logs. [`IngestMetrics::render_prometheus`] replays
//! the snapshot through the `metrics` facade into a private Prometheus
//! recorder, so several schedulers in one process never share a global one.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;

use chatsync_core::{AttemptStatus, ParseMode, SourceId};
use chatsync_fetch::{RetryObserver, RetryReason};

use crate::policy::HistoricalReason;

/// Metric names as exported.
pub mod names {
    /// Gauge: unix time of the last completed tick.
    pub const TICK_LAST_SUCCESS_TIMESTAMP: &str = "tick_last_success_timestamp";
    /// Counter: ticks completed while holding the cluster lock.
    pub const TICKS_TOTAL: &str = "ticks_total";
    /// Gauge: seconds since each source's watermark.
    pub const WATERMARK_AGE_SECONDS: &str = "watermark_age_seconds";
    /// Counter: per-source attempts by mode and status.
    pub const PARSE_ATTEMPTS_TOTAL: &str = "parse_attempts_total";
    /// Counter: fetch retries by reason.
    pub const RETRIES_TOTAL: &str = "retries_total";
    /// Gauge: accumulated mandated rate-limit waits.
    pub const RATE_LIMIT_WAIT_SECONDS_TOTAL: &str = "rate_limit_wait_seconds_total";
    /// Counter: historical mode forced by the safeguard.
    pub const FORCED_MODE_TOTAL: &str = "forced_mode_total";
    /// Counter: cluster lock attempts by result.
    pub const LOCK_ACQUIRED_TOTAL: &str = "lock_acquired_total";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockResult {
    Acquired,
    Contended,
    Error,
}

impl LockResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::Contended => "contended",
            Self::Error => "error",
        }
    }
}

/// Point-in-time copy of every metric family.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub tick_last_success_timestamp: Option<DateTime<Utc>>,
    pub watermark_age_seconds: BTreeMap<SourceId, f64>,
    /// mode -> status -> count. Mode is `"none"` for attempts that never
    /// reached a mode decision.
    pub parse_attempts_total: BTreeMap<String, BTreeMap<String, u64>>,
    pub retries_total: BTreeMap<String, u64>,
    pub rate_limit_wait_seconds_total: f64,
    pub forced_mode_total: BTreeMap<String, u64>,
    pub lock_acquired_total: BTreeMap<String, u64>,
    pub ticks_total: u64,
}

impl MetricsSnapshot {
    pub fn attempts(&self, mode: &str, status: &str) -> u64 {
        self.parse_attempts_total
            .get(mode)
            .and_then(|by_status| by_status.get(status))
            .copied()
            .unwrap_or(0)
    }

    pub fn retries(&self, reason: RetryReason) -> u64 {
        self.retries_total.get(reason.as_str()).copied().unwrap_or(0)
    }

    pub fn forced(&self, reason: HistoricalReason) -> u64 {
        self.forced_mode_total.get(reason.as_str()).copied().unwrap_or(0)
    }

    pub fn lock(&self, result: LockResult) -> u64 {
        self.lock_acquired_total.get(result.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct IngestMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn record_attempt(&self, mode: Option<ParseMode>, status: AttemptStatus) {
        let mode = mode.map_or("none", ParseMode::as_str);
        self.update(|m| {
            *m.parse_attempts_total
                .entry(mode.to_string())
                .or_default()
                .entry(status.as_str().to_string())
                .or_default() += 1;
        });
    }

    pub fn record_retry(&self, reason: RetryReason, delay: Duration) {
        self.update(|m| {
            *m.retries_total.entry(reason.as_str().to_string()).or_default() += 1;
            if reason == RetryReason::RateLimited {
                m.rate_limit_wait_seconds_total += delay.as_secs_f64();
            }
        });
    }

    pub fn record_forced(&self, reason: HistoricalReason) {
        self.update(|m| *m.forced_mode_total.entry(reason.as_str().to_string()).or_default() += 1);
    }

    pub fn record_lock(&self, result: LockResult) {
        self.update(|m| *m.lock_acquired_total.entry(result.as_str().to_string()).or_default() += 1);
    }

    pub fn record_tick_success(&self, at: DateTime<Utc>) {
        self.update(|m| {
            m.tick_last_success_timestamp = Some(at);
            m.ticks_total += 1;
        });
    }

    pub fn set_watermark_age(&self, source_id: SourceId, age: chrono::Duration) {
        let secs = age.num_milliseconds() as f64 / 1000.0;
        self.update(|m| {
            m.watermark_age_seconds.insert(source_id, secs.max(0.0));
        });
    }

    /// Drops the gauge for a source whose watermark no longer exists.
    pub fn clear_watermark_age(&self, source_id: SourceId) {
        self.update(|m| {
            m.watermark_age_seconds.remove(&source_id);
        });
    }

    /// Prometheus text exposition of every family.
    pub fn render_prometheus(&self) -> String {
        let m = self.snapshot();
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe_gauge!(names::TICK_LAST_SUCCESS_TIMESTAMP, "Unix time of the last completed tick.");
            describe_counter!(names::TICKS_TOTAL, "Ticks completed while holding the cluster lock.");
            describe_gauge!(names::WATERMARK_AGE_SECONDS, "Seconds since each source's watermark.");
            describe_counter!(names::PARSE_ATTEMPTS_TOTAL, "Per-source attempts by mode and status.");
            describe_counter!(names::RETRIES_TOTAL, "Fetch retries by reason.");
            describe_gauge!(names::RATE_LIMIT_WAIT_SECONDS_TOTAL, "Time spent in mandated rate-limit waits.");
            describe_counter!(names::FORCED_MODE_TOTAL, "Historical mode forced by the safeguard.");
            describe_counter!(names::LOCK_ACQUIRED_TOTAL, "Cluster lock attempts by result.");

            if let Some(at) = m.tick_last_success_timestamp {
                gauge!(names::TICK_LAST_SUCCESS_TIMESTAMP).set(at.timestamp() as f64);
            }
            counter!(names::TICKS_TOTAL).absolute(m.ticks_total);

            for (source, age) in &m.watermark_age_seconds {
                gauge!(names::WATERMARK_AGE_SECONDS, "source" => source.to_string()).set(*age);
            }
            for (mode, by_status) in &m.parse_attempts_total {
                for (status, n) in by_status {
                    counter!(
                        names::PARSE_ATTEMPTS_TOTAL,
                        "mode" => mode.clone(),
                        "status" => status.clone(),
                    )
                    .absolute(*n);
                }
            }
            for (reason, n) in &m.retries_total {
                counter!(names::RETRIES_TOTAL, "reason" => reason.clone()).absolute(*n);
            }
            gauge!(names::RATE_LIMIT_WAIT_SECONDS_TOTAL).set(m.rate_limit_wait_seconds_total);
            for (reason, n) in &m.forced_mode_total {
                counter!(names::FORCED_MODE_TOTAL, "reason" => reason.clone()).absolute(*n);
            }
            for (result, n) in &m.lock_acquired_total {
                counter!(names::LOCK_ACQUIRED_TOTAL, "result" => result.clone()).absolute(*n);
            }
        });

        handle.render()
    }
}

impl RetryObserver for IngestMetrics {
    fn on_retry(&self, reason: RetryReason, delay: Duration) {
        self.record_retry(reason, delay);
    }
}
