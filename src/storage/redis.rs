//! Redis-backed bucket for the generic key-value storage.
//!
//! Unlike the in-memory and on-disk buckets this gives the engine a
//! client/server backend: multiple processes can share one Redis. Keys
//! are namespaced per bucket; traversal uses `SCAN MATCH`, so it never
//! blocks the server the way `KEYS` would.
//!
//! Note the storage's coarse lock only excludes writers within one
//! process; run a single engine process against a given Redis keyspace.

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;

use super::error::{Result, StorageError};
use super::kv::{KvBucket, KvStorage};

/// One namespaced bucket in a shared Redis keyspace.
pub struct RedisBucket {
    pool: Pool,
    prefix: String,
}

impl RedisBucket {
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl KvBucket for RedisBucket {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        Ok(conn.get::<_, Option<Vec<u8>>>(self.namespaced(key)).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(self.namespaced(key), value).await?;
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        Ok(conn.exists::<_, bool>(self.namespaced(key)).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.namespaced(key)).await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> =
            conn.scan_match(format!("{}*", self.prefix)).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key[self.prefix.len()..].to_string());
        }
        Ok(keys)
    }
}

/// Engine storage over Redis buckets.
pub type RedisStorage = KvStorage<RedisBucket>;

impl RedisStorage {
    /// Connects to Redis and namespaces the four engine buckets under
    /// `praxis:`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(Self::with_buckets(
            RedisBucket::new(pool.clone(), "praxis:step:"),
            RedisBucket::new(pool.clone(), "praxis:cmd:"),
            RedisBucket::new(pool.clone(), "praxis:event:"),
            RedisBucket::new(pool, "praxis:status:"),
        ))
    }
}
