//! Redis implementation of RTDB traits

use crate::traits::Rtdb;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use common::redis::{RedisClient, RedisConfig};
use std::sync::Arc;
use std::time::Duration;

/// Redis-backed RTDB implementation
pub struct RedisRtdb {
    client: Arc<RedisClient>,
}

impl RedisRtdb {
    /// Create new Redis RTDB from URL
    pub async fn new(url: &str) -> Result<Self> {
        Ok(Self {
            client: Arc::new(RedisClient::new(url).await?),
        })
    }

    /// Create new Redis RTDB with explicit pool settings
    pub async fn with_config(config: RedisConfig) -> Result<Self> {
        Ok(Self {
            client: Arc::new(RedisClient::with_config(config).await?),
        })
    }

    /// Create from existing RedisClient
    pub fn from_client(client: Arc<RedisClient>) -> Self {
        Self { client }
    }

    /// Get reference to underlying Redis client
    pub fn client(&self) -> &Arc<RedisClient> {
        &self.client
    }
}

/// Redis EX takes whole seconds; sub-second TTLs round up to one
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Rtdb for RedisRtdb {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.client.get(key).await?.map(Bytes::from))
    }

    async fn get_ex(&self, key: &str, ttl: Duration) -> Result<Option<Bytes>> {
        Ok(self
            .client
            .get_ex(key, ttl_secs(ttl))
            .await?
            .map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.client.set(key, &value).await
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.client.set_ex(key, &value, ttl_secs(ttl)).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.client.del(&[key]).await? > 0)
    }

    async fn mget_ex(&self, keys: &[String], ttl: Duration) -> Result<Vec<Option<Bytes>>> {
        let values = self
            .client
            .pipeline_get_ex(keys, ttl_secs(ttl))
            .await
            .context("RTDB batch read failed")?;
        Ok(values.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    async fn mset_ex(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<()> {
        let entries: Vec<(String, Vec<u8>)> = entries
            .into_iter()
            .map(|(k, v)| (k, v.to_vec()))
            .collect();
        self.client
            .pipeline_set_ex(&entries, ttl_secs(ttl))
            .await
            .context("RTDB batch write failed")
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.client.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.client.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.client.smembers(key).await
    }

    async fn ping(&self) -> Result<()> {
        let pong = self.client.ping().await?;
        anyhow::ensure!(pong == "PONG", "unexpected PING reply: {}", pong);
        Ok(())
    }

    async fn info(&self) -> Result<String> {
        self.client.info(Some("server")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_up_to_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(86_400)), 86_400);
    }
}
