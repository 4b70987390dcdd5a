//! Service configuration
//!
//! Layered with figment: built-in defaults, then an optional YAML file, then
//! `PLCSRV_`-prefixed environment variables (`__` separates nested keys, e.g.
//! `PLCSRV_RETRY__MAX_RETRIES=5`).

use crate::error::{PlcError, Result};
use common::{LoggingConfig, RedisConfig};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "PLCSRV_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub cache: CacheConfig,
    pub connection: ConnectionConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub manager: ManagerConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding device and tag configuration
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/plcsrv.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace prepended to every key, e.g. `gw1:`
    pub key_prefix: String,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            ttl_secs: 86_400,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// Used when a device address carries no port
    pub default_port: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            io_timeout_ms: 3_000,
            default_port: crate::protocol::frame::ISO_TCP_PORT,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub discovery_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 10_000,
        }
    }
}

impl ManagerConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub sync_on_startup: bool,
    /// Above this many dirty devices an incremental pass becomes a full one
    pub full_sync_device_threshold: usize,
    /// Above this many dirty tags an incremental pass becomes a full one
    pub full_sync_tag_threshold: usize,
    /// Concurrent per-entity reconciliations
    pub max_parallel: usize,
    /// Incremental passes also re-read rows stamped this long before the
    /// previous pass started
    pub change_overlap_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            sync_on_startup: true,
            full_sync_device_threshold: 50,
            full_sync_tag_threshold: 200,
            max_parallel: 8,
            change_overlap_ms: 1000,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn change_overlap(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.change_overlap_ms).unwrap_or(i64::MAX))
    }
}

impl AppConfig {
    /// Build the layered figment without extracting it
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from defaults, optional YAML file and environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(PlcError::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
        }
        let config: AppConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_retries == 0 {
            return Err(PlcError::Config("retry.max_retries must be at least 1".into()));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(PlcError::Config("retry.backoff_factor must be >= 1.0".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(PlcError::Config(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.sync.max_parallel == 0 {
            return Err(PlcError::Config("sync.max_parallel must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.cache.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.sync.full_sync_device_threshold, 50);
        assert_eq!(config.sync.full_sync_tag_threshold, 200);
        assert_eq!(config.sync.change_overlap(), chrono::Duration::seconds(1));
        assert_eq!(config.connection.default_port, 102);
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn test_yaml_then_env_layering() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "retry:\n  max_retries: 7\nbreaker:\n  cooldown_ms: 1000\ncache:\n  key_prefix: \"gw1:\""
        )
        .unwrap();

        std::env::set_var("PLCSRV_RETRY__MAX_RETRIES", "9");
        let result = AppConfig::load(Some(file.path()));
        std::env::remove_var("PLCSRV_RETRY__MAX_RETRIES");

        let config = result.unwrap();
        assert_eq!(config.retry.max_retries, 9);
        assert_eq!(config.breaker.cooldown_ms, 1000);
        assert_eq!(config.cache.key_prefix, "gw1:");
        assert_eq!(config.sync.interval_secs, 60);
    }

    #[test]
    fn test_missing_file_rejected() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/plcsrv.yaml"))).unwrap_err();
        assert!(matches!(err, PlcError::Config(_)));
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        config.retry.max_retries = 0;
        assert!(config.validate().is_err());
    }
}
