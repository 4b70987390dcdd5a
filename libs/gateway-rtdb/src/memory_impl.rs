//! In-memory RTDB implementation
//!
//! Uses DashMap for concurrent access. Expiry is evaluated lazily on access,
//! measured with `tokio::time::Instant` so paused-clock tests see TTLs move.

use crate::error::RtdbError;
use crate::traits::Rtdb;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory RTDB implementation with concurrent access support
pub struct MemoryRtdb {
    kv_store: Arc<DashMap<String, Entry>>,
    set_store: Arc<DashMap<String, DashSet<String>>>,
    writes: AtomicU64,
    reads: AtomicU64,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryRtdb {
    pub fn new() -> Self {
        Self {
            kv_store: Arc::new(DashMap::new()),
            set_store: Arc::new(DashMap::new()),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Clear all data and counters
    pub fn clear(&self) {
        self.kv_store.clear();
        self.set_store.clear();
        self.writes.store(0, Ordering::Relaxed);
        self.reads.store(0, Ordering::Relaxed);
    }

    /// Make every subsequent write fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent read fail until reset
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Remaining TTL of a key, `None` for missing or persistent keys
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.kv_store
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Get statistics about stored data
    pub fn stats(&self) -> MemoryStats {
        let now = Instant::now();
        MemoryStats {
            kv_count: self.kv_store.iter().filter(|e| !e.is_expired(now)).count(),
            set_count: self.set_store.len(),
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
        }
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(RtdbError::Unavailable("writes disabled".to_string()).into());
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(RtdbError::Unavailable("reads disabled".to_string()).into());
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_live(&self, key: &str, refresh: Option<Duration>) -> Option<Bytes> {
        let now = Instant::now();
        let mut entry = self.kv_store.get_mut(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.kv_store.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        if let Some(ttl) = refresh {
            entry.expires_at = Some(now + ttl);
        }
        Some(entry.value.clone())
    }

    fn insert(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.kv_store
            .insert(key.to_string(), Entry { value, expires_at });
    }
}

impl Default for MemoryRtdb {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about memory RTDB usage
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub kv_count: usize,
    pub set_count: usize,
    /// Successful write commands (a batch of N counts N)
    pub writes: u64,
    pub reads: u64,
}

#[async_trait]
impl Rtdb for MemoryRtdb {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_read()?;
        Ok(self.read_live(key, None))
    }

    async fn get_ex(&self, key: &str, ttl: Duration) -> Result<Option<Bytes>> {
        self.check_read()?;
        Ok(self.read_live(key, Some(ttl)))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.check_write()?;
        self.insert(key, value, None);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.check_write()?;
        self.insert(key, value, Some(ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.check_write()?;
        let now = Instant::now();
        let kv = self
            .kv_store
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired(now));
        // DEL removes keys of any type
        let set = self.set_store.remove(key).is_some();
        Ok(kv || set)
    }

    async fn mget_ex(&self, keys: &[String], ttl: Duration) -> Result<Vec<Option<Bytes>>> {
        self.check_read()?;
        Ok(keys.iter().map(|k| self.read_live(k, Some(ttl))).collect())
    }

    async fn mset_ex(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(RtdbError::Unavailable("writes disabled".to_string()).into());
        }
        self.writes
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        for (key, value) in entries {
            self.insert(&key, value, Some(ttl));
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.check_write()?;
        Ok(self
            .set_store
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.check_write()?;
        let removed = match self.set_store.get(key) {
            Some(set) => set.remove(member).is_some(),
            None => false,
        };
        self.set_store.remove_if(key, |_, set| set.is_empty());
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.check_read()?;
        Ok(self
            .set_store
            .get(key)
            .map(|set| set.iter().map(|m| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        self.check_read()
    }

    async fn info(&self) -> Result<String> {
        let stats = self.stats();
        Ok(format!(
            "backend:memory\r\nkeys:{}\r\nsets:{}\r\nwrites:{}\r\nreads:{}\r\n",
            stats.kv_count, stats.set_count, stats.writes, stats.reads
        ))
    }
}
