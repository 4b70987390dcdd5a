//! Gateway basic library
//!
//! Provides infrastructure shared by gateway services, including:
//! - pooled Redis client
//! - SQLite client
//! - logging initialisation
//! - shutdown signal handling

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod logging;
pub mod shutdown;

pub use logging::LoggingConfig;

#[cfg(feature = "redis")]
pub use redis::{RedisClient, RedisConfig};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteClient, SqlitePool};

// Re-export common dependencies
pub use anyhow;
pub use tokio;

// Pre-import common types
pub mod prelude {
    #[cfg(feature = "redis")]
    pub use crate::redis::RedisClient;
    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::SqliteClient;
}
