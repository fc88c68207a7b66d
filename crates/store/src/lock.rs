//! Cluster-wide single-flight lock with TTL.
//!
//! `acquire` is a non-blocking set-if-absent-with-expiry; `release` deletes
//! only when the caller still owns the key. There is no renewal: a holder that
//! outlives its TTL may find the key owned by someone else, and its late
//! `release` must then be a no-op.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::StoreError;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try once to take `key` for `owner`. `Ok(false)` means someone else
    /// holds a live lock.
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` if it is still owned by `owner`. Returns whether a row
    /// was deleted.
    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError>;
}

// ── PostgreSQL ───────────────────────────────────────────────────────

/// `cluster_locks` table. Expiry is computed from the database clock so
/// instances with skewed clocks agree on when a lock is dead.
#[derive(Debug, Clone)]
pub struct PgLock {
    pool: PgPool,
}

impl PgLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for PgLock {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO cluster_locks (key, owner_id, expires_at)
             VALUES ($1, $2, (now() AT TIME ZONE 'utc') + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE
                SET owner_id = EXCLUDED.owner_id,
                    expires_at = EXCLUDED.expires_at
              WHERE cluster_locks.expires_at <= (now() AT TIME ZONE 'utc')",
        )
        .bind(key)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(key, owner, acquired, "lock acquire");
        Ok(acquired)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM cluster_locks WHERE key = $1 AND owner_id = $2")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        let released = result.rows_affected() == 1;
        debug!(key, owner, released, "lock release");
        Ok(released)
    }
}

// ── In-memory ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Holder {
    owner: String,
    expires_at: Instant,
}

/// Process-local lock table. Expiry follows tokio's clock, so paused-time
/// tests can step past a TTL.
#[derive(Debug, Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, Holder>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live owner of `key`, if any.
    pub async fn owner(&self, key: &str) -> Option<String> {
        let held = self.held.lock().await;
        held.get(key)
            .filter(|h| h.expires_at > Instant::now())
            .map(|h| h.owner.clone())
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut held = self.held.lock().await;
        if let Some(current) = held.get(key) {
            if current.expires_at > now {
                return Ok(false);
            }
        }
        held.insert(
            key.to_string(),
            Holder {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut held = self.held.lock().await;
        match held.get(key) {
            Some(current) if current.owner == owner => {
                held.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const KEY: &str = "chatsync:scheduler:tick";
    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn concurrent_acquire_has_exactly_one_winner() {
        let lock = Arc::new(MemoryLock::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lock = lock.clone();
                tokio::spawn(async move { lock.acquire(KEY, &format!("worker-{i}"), TTL).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn release_frees_the_key() {
        let lock = MemoryLock::new();
        assert!(lock.acquire(KEY, "a", TTL).await.unwrap());
        assert!(!lock.acquire(KEY, "b", TTL).await.unwrap());

        assert!(lock.release(KEY, "a").await.unwrap());
        assert!(lock.acquire(KEY, "b", TTL).await.unwrap());
        assert_eq!(lock.owner(KEY).await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn release_by_non_owner_is_a_noop() {
        let lock = MemoryLock::new();
        lock.acquire(KEY, "a", TTL).await.unwrap();

        assert!(!lock.release(KEY, "b").await.unwrap());
        assert_eq!(lock.owner(KEY).await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_release_after_expiry_keeps_new_owner() {
        let lock = MemoryLock::new();
        assert!(lock.acquire(KEY, "slow", TTL).await.unwrap());

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(lock.acquire(KEY, "fresh", TTL).await.unwrap());

        assert!(!lock.release(KEY, "slow").await.unwrap());
        assert_eq!(lock.owner(KEY).await.as_deref(), Some("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn live_lock_is_not_stolen_before_ttl() {
        let lock = MemoryLock::new();
        lock.acquire(KEY, "a", TTL).await.unwrap();

        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert!(!lock.acquire(KEY, "b", TTL).await.unwrap());
    }
}
