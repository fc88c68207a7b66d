//! Durable backends for the ingestion scheduler.
//!
//! Each concern is a trait with a PostgreSQL implementation and an in-memory
//! one with the same semantics:
//! - [`WatermarkStore`]: monotonic per-source high-water mark
//! - [`DistributedLock`]: cluster-wide single-flight lock with TTL
//! - [`BatchPersister`]: idempotent, transactional batch writes
//! - [`SourceRegistry`]: active sources and the `last_parsed_at` write-back
//! - [`AttemptLog`]: per-source attempt records

pub mod attempt_log;
pub mod db;
pub mod error;
pub mod lock;
pub mod persister;
pub mod redis_lock;
pub mod registry;
pub mod watermark;

pub use attempt_log::{AttemptLog, JsonlAttemptLog, MemoryAttemptLog, PgAttemptLog};
pub use error::StoreError;
pub use lock::{DistributedLock, MemoryLock, PgLock};
pub use persister::{BatchPersister, MemoryBatchPersister, PgBatchPersister, StoredRecord};
pub use redis_lock::RedisLock;
pub use registry::{MemorySourceRegistry, PgSourceRegistry, SourceRegistry};
pub use watermark::{MemoryWatermarkStore, PgWatermarkStore, WatermarkStore};
