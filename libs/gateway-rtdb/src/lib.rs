//! Gateway realtime database abstraction
//!
//! A small key/value interface shared by the live tag-value cache and the
//! fast-access configuration mirror, with a Redis backend for production and
//! an in-memory backend for tests and single-node deployments.

pub mod error;
pub mod memory_impl;
pub mod traits;

#[cfg(feature = "redis-backend")]
pub mod redis_impl;

// Re-exports
pub use bytes::Bytes;
pub use error::RtdbError;
pub use memory_impl::{MemoryRtdb, MemoryStats};
pub use traits::Rtdb;

#[cfg(feature = "redis-backend")]
pub use redis_impl::RedisRtdb;

/// Helper functions for common operations
pub mod helpers {
    use super::{MemoryRtdb, Rtdb};
    use std::sync::Arc;

    /// Create an in-memory RTDB for unit testing
    pub fn create_test_rtdb() -> Arc<dyn Rtdb> {
        Arc::new(MemoryRtdb::new())
    }
}
