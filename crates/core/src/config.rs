use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
    pub source_api: SourceApiConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CHATSYNC_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("CHATSYNC_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            scheduler: SchedulerConfig::from_env_profiled(p),
            storage: StorageConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
            redis: RedisConfig::from_env_profiled(p),
            source_api: SourceApiConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        let s = &self.scheduler;
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  scheduler:   tick={}s, concurrency={}, attempts={}, lock_ttl={}s",
            s.tick_interval.as_secs(),
            s.max_concurrency,
            s.retry_max_attempts,
            s.lock_ttl.as_secs()
        );
        tracing::info!(
            "  windows:     staleness={}s, overlap={}s, historical={}d",
            s.staleness_threshold.as_secs(),
            s.overlap_margin.as_secs(),
            s.historical_window_days
        );
        tracing::info!("  storage:     data_dir={}", self.storage.data_dir.display());
        tracing::info!("  postgres:    host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!("  redis:       configured={}", self.redis.is_configured());
        tracing::info!(
            "  source_api:  url={}, token={}",
            self.source_api.base_url,
            if self.source_api.token.is_some() { "(set)" } else { "(none)" }
        );
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Tuning knobs for the ingestion tick. Staleness and overlap are operational
/// settings, not contracts, so everything here is overridable per profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Worker-pool size for one tick (sources fetched in parallel).
    pub max_concurrency: usize,
    /// Attempts per fetch call for transient failures (first try included).
    pub retry_max_attempts: u32,
    pub staleness_threshold: Duration,
    pub overlap_margin: Duration,
    pub lock_ttl: Duration,
    pub lock_key: String,
    /// Initial backfill window for sources that were never parsed.
    pub historical_window_days: u32,
    pub page_size: u32,
    pub max_historical_pages: u32,
    pub max_incremental_pages: u32,
    pub fetch_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub rate_limit_jitter: Duration,
    /// Mandated rate-limit waits tolerated per fetch call. Separate from
    /// `retry_max_attempts`.
    pub max_rate_limit_waits: u32,
    pub dead_source_cooldown: Duration,
    pub emit_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            max_concurrency: 4,
            retry_max_attempts: 4,
            staleness_threshold: Duration::from_secs(24 * 3600),
            overlap_margin: Duration::from_secs(30 * 60),
            lock_ttl: Duration::from_secs(180),
            lock_key: "chatsync:scheduler:tick".to_string(),
            historical_window_days: 7,
            page_size: 100,
            max_historical_pages: 50,
            max_incremental_pages: 5,
            fetch_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            rate_limit_jitter: Duration::from_millis(250),
            max_rate_limit_waits: 5,
            dead_source_cooldown: Duration::from_secs(6 * 3600),
            emit_timeout: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            tick_interval: Duration::from_secs(profiled_env_u64(p, "TICK_INTERVAL_SECS", d.tick_interval.as_secs())),
            max_concurrency: profiled_env_u32(p, "MAX_CONCURRENCY", d.max_concurrency as u32) as usize,
            retry_max_attempts: profiled_env_u32(p, "RETRY_MAX_ATTEMPTS", d.retry_max_attempts),
            staleness_threshold: Duration::from_secs(profiled_env_u64(
                p,
                "STALENESS_THRESHOLD_SECS",
                d.staleness_threshold.as_secs(),
            )),
            overlap_margin: Duration::from_secs(profiled_env_u64(p, "OVERLAP_MARGIN_SECS", d.overlap_margin.as_secs())),
            lock_ttl: Duration::from_secs(profiled_env_u64(p, "LOCK_TTL_SECS", d.lock_ttl.as_secs())),
            lock_key: profiled_env_or(p, "LOCK_KEY", &d.lock_key),
            historical_window_days: profiled_env_u32(p, "HISTORICAL_WINDOW_DAYS", d.historical_window_days),
            page_size: profiled_env_u32(p, "PAGE_SIZE", d.page_size),
            max_historical_pages: profiled_env_u32(p, "MAX_HISTORICAL_PAGES", d.max_historical_pages),
            max_incremental_pages: profiled_env_u32(p, "MAX_INCREMENTAL_PAGES", d.max_incremental_pages),
            fetch_timeout: Duration::from_secs(profiled_env_u64(p, "FETCH_TIMEOUT_SECS", d.fetch_timeout.as_secs())),
            backoff_base: Duration::from_millis(profiled_env_u64(p, "BACKOFF_BASE_MS", 500)),
            backoff_max: Duration::from_millis(profiled_env_u64(p, "BACKOFF_MAX_MS", 30_000)),
            rate_limit_jitter: Duration::from_millis(profiled_env_u64(p, "RATE_LIMIT_JITTER_MS", 250)),
            max_rate_limit_waits: profiled_env_u32(p, "MAX_RATE_LIMIT_WAITS", d.max_rate_limit_waits),
            dead_source_cooldown: Duration::from_secs(profiled_env_u64(
                p,
                "DEAD_SOURCE_COOLDOWN_SECS",
                d.dead_source_cooldown.as_secs(),
            )),
            emit_timeout: Duration::from_secs(profiled_env_u64(p, "EMIT_TIMEOUT_SECS", d.emit_timeout.as_secs())),
        }
    }

    /// Reject settings the scheduler cannot run with.
    ///
    /// The lock TTL must cover at least one tick interval; shorter TTLs let a
    /// second instance start a tick while the first is still inside its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".into()));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::Invalid("retry_max_attempts must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be at least 1".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick_interval must be non-zero".into()));
        }
        if self.lock_ttl < self.tick_interval {
            return Err(ConfigError::Invalid(format!(
                "lock_ttl ({}s) must not be shorter than tick_interval ({}s)",
                self.lock_ttl.as_secs(),
                self.tick_interval.as_secs()
            )));
        }
        if self.lock_key.trim().is_empty() {
            return Err(ConfigError::Invalid("lock_key must not be empty".into()));
        }
        Ok(())
    }

    /// Initial backfill window as a chrono duration.
    pub fn historical_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.historical_window_days))
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            data_dir: PathBuf::from(profiled_env_or(p, "DATA_DIR", "data")),
        }
    }

    /// Default location of the JSONL attempt log.
    pub fn attempt_log_path(&self) -> PathBuf {
        self.data_dir.join("ingestion").join("attempts.jsonl")
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "chatsync"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    /// Connection URL with the credentials and database name percent-encoded.
    pub fn connection_string(&self) -> Result<String, ConfigError> {
        let invalid = |part: &str| ConfigError::Invalid(format!("postgres {part} cannot be encoded"));
        let mut url = Url::parse(&format!("postgres://{}:{}/", self.host, self.port))
            .map_err(|e| ConfigError::Invalid(format!("postgres host {:?}: {e}", self.host)))?;
        url.set_username(self.username.as_deref().unwrap_or("postgres"))
            .map_err(|()| invalid("username"))?;
        url.set_password(self.password.as_deref().filter(|p| !p.is_empty()))
            .map_err(|()| invalid("password"))?;
        url.path_segments_mut()
            .map_err(|()| invalid("database"))?
            .clear()
            .push(&self.database);
        url.query_pairs_mut().append_pair("sslmode", &self.ssl_mode);
        Ok(url.into())
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── Redis ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: Option<String>,
}

impl RedisConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "REDIS_URL"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

// ── Message gateway ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceApiConfig {
    pub base_url: String,
    pub token: Option<String>,
}

impl SourceApiConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            base_url: profiled_env_or(p, "SOURCE_API_URL", "http://localhost:8089"),
            token: profiled_env_opt(p, "SOURCE_API_TOKEN"),
        }
    }
}
