//! Shared fixtures for plcsrv integration tests
#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;

use common::sqlite::SqliteClient;
use gateway_rtdb::{MemoryRtdb, Rtdb};
use plcsrv::config::{CacheConfig, ConnectionConfig};
use plcsrv::device::{CircuitBreakerConfig, DeviceConnection, ResilientClient, RetryPolicy};
use plcsrv::protocol::{Connector, Endpoint};
use plcsrv::{RtdbConfigStore, SqliteStore, TagCache};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub async fn durable_store() -> Arc<SqliteStore> {
    let client = Arc::new(SqliteClient::in_memory().await.unwrap());
    Arc::new(SqliteStore::bootstrap(client).await.unwrap())
}

pub fn fast_store() -> (Arc<MemoryRtdb>, Arc<RtdbConfigStore>) {
    let backend = Arc::new(MemoryRtdb::new());
    let store = Arc::new(RtdbConfigStore::new(backend.clone() as Arc<dyn Rtdb>, "test:"));
    (backend, store)
}

pub fn tag_cache() -> (Arc<MemoryRtdb>, Arc<TagCache>) {
    let backend = Arc::new(MemoryRtdb::new());
    let cache = Arc::new(TagCache::new(
        backend.clone() as Arc<dyn Rtdb>,
        &CacheConfig {
            key_prefix: "test:".into(),
            ttl_secs: 3600,
        },
    ));
    (backend, cache)
}

pub fn endpoint(host: &str, port: u16) -> Endpoint {
    Endpoint {
        host: host.to_string(),
        port,
        rack: 0,
        slot: 1,
    }
}

pub fn client(
    device_id: i64,
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    breaker: CircuitBreakerConfig,
) -> Arc<ResilientClient> {
    let conn = Arc::new(DeviceConnection::new(
        endpoint,
        connector,
        &ConnectionConfig::default(),
    ));
    Arc::new(ResilientClient::new(device_id, conn, retry, breaker))
}
