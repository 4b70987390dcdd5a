//! Redis client module with connection pooling
//!
//! Provides a minimal async Redis client with only the commands the gateway
//! uses: plain and expiring string keys, sets, pipelined batches and health
//! checks.

use anyhow::{Context, Result};
use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Redis connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections
    pub min_idle: Option<u32>,
    /// Connection timeout in seconds
    pub connection_timeout: u64,
    /// Idle timeout in seconds
    pub idle_timeout: Option<u64>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_connections: 32,
            min_idle: Some(4),
            connection_timeout: 5,
            idle_timeout: Some(600), // 10 minutes
        }
    }
}

impl RedisConfig {
    /// Create config from URL with default pool settings
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Redis asynchronous client with connection pooling
#[derive(Clone)]
pub struct RedisClient {
    pool: Arc<Pool<RedisConnectionManager>>,
    url: String,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("url", &self.url)
            .field("pool_state", &self.pool.state())
            .finish()
    }
}

impl RedisClient {
    /// Create a new client with default configuration
    pub async fn new(url: &str) -> Result<Self> {
        Self::with_config(RedisConfig::from_url(url)).await
    }

    /// Create a new client with custom configuration and verify it with PING
    pub async fn with_config(config: RedisConfig) -> Result<Self> {
        let client = Self::build(config).await?;
        client
            .ping()
            .await
            .context("Failed to ping Redis server")?;
        Ok(client)
    }

    async fn build(config: RedisConfig) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.url.as_str())
            .context("Failed to create Redis connection manager")?;

        let mut pool_builder = Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(Duration::from_secs(config.connection_timeout));

        if let Some(min_idle) = config.min_idle {
            pool_builder = pool_builder.min_idle(Some(min_idle));
        }

        if let Some(idle_timeout) = config.idle_timeout {
            pool_builder = pool_builder.idle_timeout(Some(Duration::from_secs(idle_timeout)));
        }

        let pool = pool_builder
            .build(manager)
            .await
            .context("Failed to build Redis connection pool")?;

        Ok(Self {
            pool: Arc::new(pool),
            url: config.url,
        })
    }

    /// Get a connection from the pool
    pub async fn get_connection(&self) -> Result<PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .context("Failed to get connection from pool")
    }

    /// GET operation
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.get_connection().await?;
        conn.get(key)
            .await
            .with_context(|| format!("Failed to GET key: {}", key))
    }

    /// GETEX operation - read a key and refresh its TTL in one round trip
    pub async fn get_ex(&self, key: &str, ttl_secs: u64) -> Result<Option<Vec<u8>>> {
        let mut conn = self.get_connection().await?;
        let value: Option<Vec<u8>> = redis::cmd("GETEX")
            .arg(key)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut *conn)
            .await
            .with_context(|| format!("Failed to GETEX key: {}", key))?;
        Ok(value)
    }

    /// SET operation without expiry
    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.set(key, value)
            .await
            .with_context(|| format!("Failed to SET key: {}", key))
    }

    /// SET with EX - upsert a key with a TTL
    pub async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut *conn)
            .await
            .with_context(|| format!("Failed to SET EX key: {}", key))?;
        Ok(())
    }

    /// DEL operation
    pub async fn del(&self, keys: &[&str]) -> Result<u32> {
        let mut conn = self.get_connection().await?;
        conn.del(keys)
            .await
            .with_context(|| format!("Failed to DEL keys: {:?}", keys))
    }

    /// SADD operation
    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let added: u32 = conn
            .sadd(key, member)
            .await
            .with_context(|| format!("Failed to SADD to key: {}", key))?;
        Ok(added > 0)
    }

    /// SREM operation
    pub async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let removed: u32 = conn
            .srem(key, member)
            .await
            .with_context(|| format!("Failed to SREM from key: {}", key))?;
        Ok(removed > 0)
    }

    /// SMEMBERS operation
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        conn.smembers(key)
            .await
            .with_context(|| format!("Failed to SMEMBERS key: {}", key))
    }

    /// Execute GETEX for many keys in a single pipeline
    pub async fn pipeline_get_ex(
        &self,
        keys: &[String],
        ttl_secs: u64,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("GETEX").arg(key).arg("EX").arg(ttl_secs);
        }

        let values: Vec<Option<Vec<u8>>> = pipe
            .query_async(&mut *conn)
            .await
            .context("Failed to execute pipeline GETEX")?;
        Ok(values)
    }

    /// Execute SET EX for many keys in a single pipeline
    pub async fn pipeline_set_ex(&self, entries: &[(String, Vec<u8>)], ttl_secs: u64) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value.as_slice())
                .arg("EX")
                .arg(ttl_secs)
                .ignore();
        }

        let _: () = pipe
            .query_async(&mut *conn)
            .await
            .context("Failed to execute pipeline SET EX")?;
        Ok(())
    }

    /// PING operation - test connection
    pub async fn ping(&self) -> Result<String> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .context("Failed to PING Redis server")?;
        Ok(pong)
    }

    /// INFO operation - raw server information for diagnostics
    pub async fn info(&self, section: Option<&str>) -> Result<String> {
        let mut conn = self.get_connection().await?;
        let mut cmd = redis::cmd("INFO");
        if let Some(section) = section {
            cmd.arg(section);
        }
        let info: String = cmd
            .query_async(&mut *conn)
            .await
            .context("Failed to read Redis INFO")?;
        Ok(info)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_from_url() {
        let config = RedisConfig::from_url("redis://10.0.0.5:6380");
        assert_eq!(config.url, "redis://10.0.0.5:6380");
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.connection_timeout, 5);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_set_ex_and_get_ex() {
        let client = RedisClient::new("redis://127.0.0.1:6379").await.unwrap();
        client.set_ex("test:common:ttl", b"42", 30).await.unwrap();
        let value = client.get_ex("test:common:ttl", 30).await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"42"[..]));
        client.del(&["test:common:ttl"]).await.unwrap();
    }
}
