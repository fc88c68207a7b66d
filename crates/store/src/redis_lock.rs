//! Redis-backed [`DistributedLock`] (requires the `redis-lock` feature).
//!
//! `SET key owner NX PX ttl` for acquisition and a compare-and-delete Lua
//! script for release. Without the feature, [`RedisLock::connect`] fails so
//! the binary can report a clear configuration error.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::lock::DistributedLock;

#[cfg(feature = "redis-lock")]
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[cfg(feature = "redis-lock")]
#[derive(Clone)]
pub struct RedisLock {
    conn: redis::aio::MultiplexedConnection,
}

#[cfg(feature = "redis-lock")]
impl RedisLock {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!("redis lock backend connected");
        Ok(Self { conn })
    }
}

#[cfg(feature = "redis-lock")]
#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

#[cfg(not(feature = "redis-lock"))]
#[derive(Debug, Clone)]
pub struct RedisLock;

#[cfg(not(feature = "redis-lock"))]
impl RedisLock {
    pub async fn connect(_url: &str) -> Result<Self, StoreError> {
        Err(StoreError::Unavailable(
            "Redis lock backend requires the 'redis-lock' Cargo feature".into(),
        ))
    }
}

#[cfg(not(feature = "redis-lock"))]
#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, _key: &str, _owner: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable(
            "Redis lock backend requires the 'redis-lock' Cargo feature".into(),
        ))
    }

    async fn release(&self, _key: &str, _owner: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable(
            "Redis lock backend requires the 'redis-lock' Cargo feature".into(),
        ))
    }
}
