//! ingest-scheduler: periodic, cluster-wide source ingestion.
//!
//! Every instance runs the same loop; the cluster lock ensures only one of
//! them executes a given tick. Non-owning instances stay idle until the next
//! interval.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use chatsync_core::config::{self, Config};
use chatsync_core::SystemClock;
use chatsync_fetch::HttpMessageSource;
use chatsync_scheduler::{DistributedScheduler, SchedulerDeps, TickOutcome, TracingEmitter};
use chatsync_store::{
    db, AttemptLog, DistributedLock, JsonlAttemptLog, PgAttemptLog, PgBatchPersister, PgLock, PgSourceRegistry,
    PgWatermarkStore, RedisLock,
};

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LockBackend {
    Postgres,
    Redis,
}

/// Ingestion scheduler worker.
#[derive(Parser, Debug)]
#[command(name = "ingest-scheduler", version, about)]
struct Cli {
    /// Run a single tick and exit.
    #[arg(long)]
    once: bool,

    /// Lock owner id for this instance. Defaults to `<host>-<uuid>`.
    #[arg(long, env = "CHATSYNC_OWNER_ID")]
    owner_id: Option<String>,

    /// Cluster lock backend.
    #[arg(long, env = "CHATSYNC_LOCK_BACKEND", value_enum, default_value_t = LockBackend::Postgres)]
    lock_backend: LockBackend,

    /// Write attempts to this JSONL file instead of the `parse_attempts` table.
    #[arg(long, env = "CHATSYNC_ATTEMPT_LOG")]
    attempt_log: Option<PathBuf>,

    /// Write attempts to `<DATA_DIR>/ingestion/attempts.jsonl`.
    #[arg(long, conflicts_with = "attempt_log")]
    jsonl_attempts: bool,

    /// Clear one source's watermark and exit.
    #[arg(long, value_name = "SOURCE_ID")]
    reset_watermark: Option<Uuid>,
}

fn default_owner_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{host}-{}", Uuid::new_v4())
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();
    config.scheduler.validate().context("invalid scheduler configuration")?;

    if !config.postgres.is_configured() {
        anyhow::bail!("PostgreSQL is not configured (set PG_USERNAME, PG_HOST, PG_DATABASE)");
    }
    let pool = db::connect(&config.postgres).await.context("connecting to PostgreSQL")?;

    let lock: Arc<dyn DistributedLock> = match cli.lock_backend {
        LockBackend::Postgres => Arc::new(PgLock::new(pool.clone())),
        LockBackend::Redis => {
            let url = config
                .redis
                .url
                .as_deref()
                .context("--lock-backend redis requires REDIS_URL")?;
            Arc::new(RedisLock::connect(url).await?)
        }
    };

    let attempt_log_path = cli
        .attempt_log
        .clone()
        .or_else(|| cli.jsonl_attempts.then(|| config.storage.attempt_log_path()));
    let attempts: Arc<dyn AttemptLog> = match &attempt_log_path {
        Some(path) => {
            info!(path = %path.display(), "recording attempts to JSONL");
            Arc::new(JsonlAttemptLog::open(path).await?)
        }
        None => Arc::new(PgAttemptLog::new(pool.clone())),
    };

    let source = HttpMessageSource::from_config(&config.source_api)
        .with_context(|| format!("invalid SOURCE_API_URL {}", config.source_api.base_url))?;

    let owner_id = cli.owner_id.clone().unwrap_or_else(default_owner_id);
    let scheduler = DistributedScheduler::new(
        config.scheduler.clone(),
        owner_id,
        SchedulerDeps {
            registry: Arc::new(PgSourceRegistry::new(pool.clone())),
            watermarks: Arc::new(PgWatermarkStore::new(pool.clone())),
            lock,
            source: Arc::new(source),
            persister: Arc::new(PgBatchPersister::new(pool.clone())),
            attempts,
            emitter: Arc::new(TracingEmitter),
            clock: Arc::new(SystemClock),
        },
    );

    if let Some(source_id) = cli.reset_watermark {
        scheduler.reset_watermark(source_id).await?;
        return Ok(());
    }

    if cli.once {
        match scheduler.run_tick().await? {
            TickOutcome::NotLocked => warn!("another instance holds the tick lock; nothing done"),
            TickOutcome::Completed(report) => info!(attempts = report.attempts.len(), "single tick finished"),
        }
        info!(metrics = %serde_json::to_string(&scheduler.metrics().snapshot())?, "metrics");
        return Ok(());
    }

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl_c");
            return;
        }
        info!("shutdown requested");
        signal.notify_one();
    });

    info!(owner_id = %scheduler.owner_id(), "ingest-scheduler starting");
    scheduler.run(shutdown).await;
    info!("final metrics:\n{}", scheduler.metrics().render_prometheus());
    info!("ingest-scheduler exited cleanly");
    Ok(())
}
