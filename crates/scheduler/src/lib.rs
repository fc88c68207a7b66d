//! Cluster-wide ingestion scheduler.
//!
//! [`DistributedScheduler`] runs one tick per interval: take the cluster
//! lock, run every active source through decide → fetch → persist →
//! advance on a bounded worker pool, record one attempt per source, update
//! metrics, release the lock.

pub mod events;
pub mod metrics;
mod pipeline;
pub mod policy;
pub mod scheduler;

pub use events::{ChannelEmitter, EmitError, EmittedEvent, EventEmitter, TracingEmitter};
pub use metrics::{IngestMetrics, LockResult, MetricsSnapshot};
pub use policy::{HistoricalReason, ModeDecision, ModeDecisionPolicy};
pub use scheduler::{DistributedScheduler, SchedulerDeps, SchedulerError, TickOutcome, TickReport};
