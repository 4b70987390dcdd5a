//! Trait definitions for RTDB abstraction

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::time::Duration;

/// Unified RTDB storage trait
///
/// Implementations:
/// - `RedisRtdb`: production Redis backend
/// - `MemoryRtdb`: in-memory backend with TTL support
#[async_trait]
pub trait Rtdb: Send + Sync + 'static {
    /// Allow downcasting to concrete types
    fn as_any(&self) -> &dyn Any;

    // ========== Key-Value Operations ==========

    /// Get value by key
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Get value and refresh its TTL
    async fn get_ex(&self, key: &str, ttl: Duration) -> Result<Option<Bytes>>;

    /// Set value for key without expiry
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Set value for key with expiry
    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Delete key, returning whether it existed
    async fn del(&self, key: &str) -> Result<bool>;

    // ========== Batch Operations ==========

    /// Pipelined GETEX; result order matches `keys`
    async fn mget_ex(&self, keys: &[String], ttl: Duration) -> Result<Vec<Option<Bytes>>>;

    /// Pipelined SET EX
    async fn mset_ex(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<()>;

    // ========== Set Operations ==========

    /// Add member to set
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove member from set
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// Get all members of set
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    // ========== Diagnostics ==========

    /// Liveness check
    async fn ping(&self) -> Result<()>;

    /// Backend description (Redis INFO, or a summary for the memory backend)
    async fn info(&self) -> Result<String>;
}
