//! Device/tag service
//!
//! The façade the HTTP layer talks to. Configuration reads go to the
//! fast-access mirror first and fall back to the durable store; writes are
//! validated, committed to the durable store, then mirrored best effort.

use crate::cache::{CachedValue, TagCache};
use crate::config::AppConfig;
use crate::error::{PlcError, Result};
use crate::manager::{DeviceManager, ManagerSettings, ManagerStats};
use crate::model::{Device, Tag, TagValue};
use crate::protocol::Connector;
use crate::store::{ConfigStore, StoreResult};
use crate::sync::{SyncService, SyncStats};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub manager: ManagerStats,
    pub sync: SyncStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn from_result<E: std::fmt::Display>(result: std::result::Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                healthy: true,
                error: None,
            },
            Err(e) => Self {
                healthy: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealth {
    pub device_id: i64,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub durable_store: ComponentHealth,
    pub fast_store: ComponentHealth,
    pub cache: ComponentHealth,
    pub devices: Vec<DeviceHealth>,
}

pub struct DeviceTagService {
    durable: Arc<dyn ConfigStore>,
    fast: Arc<dyn ConfigStore>,
    cache: Arc<TagCache>,
    manager: Arc<DeviceManager>,
    sync: Arc<SyncService>,
}

impl DeviceTagService {
    pub fn new(
        durable: Arc<dyn ConfigStore>,
        fast: Arc<dyn ConfigStore>,
        cache: Arc<TagCache>,
        connector: Arc<dyn Connector>,
        config: &AppConfig,
    ) -> Self {
        let manager = Arc::new(DeviceManager::new(
            Arc::clone(&durable),
            Arc::clone(&fast),
            Arc::clone(&cache),
            connector,
            ManagerSettings {
                manager: config.manager.clone(),
                connection: config.connection.clone(),
                retry: config.retry.clone(),
                breaker: config.breaker.clone(),
            },
        ));
        let sync = Arc::new(SyncService::new(
            Arc::clone(&durable),
            Arc::clone(&fast),
            config.sync.clone(),
        ));
        Self {
            durable,
            fast,
            cache,
            manager,
            sync,
        }
    }

    pub fn manager(&self) -> &Arc<DeviceManager> {
        &self.manager
    }

    pub fn sync(&self) -> &Arc<SyncService> {
        &self.sync
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    pub async fn get_device(&self, id: i64) -> Result<Device> {
        read_through(
            "device",
            self.fast.get_device(id),
            self.durable.get_device(id),
        )
        .await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        read_list_through(
            "devices",
            self.fast.list_devices(),
            self.durable.list_devices(),
        )
        .await
    }

    pub async fn list_active_devices(&self) -> Result<Vec<Device>> {
        read_list_through(
            "active devices",
            self.fast.list_active_devices(),
            self.durable.list_active_devices(),
        )
        .await
    }

    pub async fn create_device(&self, device: &Device) -> Result<Device> {
        device.validate()?;
        let created = self.durable.create_device(device).await?;
        info!(device_id = created.id, "Created device '{}'", created.name);
        self.mirror_device(created.id).await;
        Ok(created)
    }

    pub async fn update_device(&self, device: &Device) -> Result<Device> {
        device.validate()?;
        let updated = self.durable.update_device(device).await?;
        info!(device_id = updated.id, "Updated device '{}'", updated.name);
        self.mirror_device(updated.id).await;
        Ok(updated)
    }

    /// Delete a device that no longer has tags
    pub async fn delete_device(&self, id: i64) -> Result<()> {
        let tags = self.durable.list_tags_for_device(id).await?;
        if !tags.is_empty() {
            return Err(PlcError::Validation(format!(
                "device {} still has {} tags",
                id,
                tags.len()
            )));
        }
        self.durable.delete_device(id).await?;
        info!(device_id = id, "Deleted device");
        self.mirror_device(id).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------

    pub async fn get_tag(&self, id: i64) -> Result<Tag> {
        read_through("tag", self.fast.get_tag(id), self.durable.get_tag(id)).await
    }

    pub async fn list_tags_for_device(&self, device_id: i64) -> Result<Vec<Tag>> {
        read_list_through(
            "device tags",
            self.fast.list_tags_for_device(device_id),
            self.durable.list_tags_for_device(device_id),
        )
        .await
    }

    pub async fn find_tags_by_name(&self, name: &str) -> Result<Vec<Tag>> {
        read_list_through(
            "tags by name",
            self.fast.find_tags_by_name(name),
            self.durable.find_tags_by_name(name),
        )
        .await
    }

    pub async fn create_tag(&self, tag: &Tag) -> Result<Tag> {
        let mut tag = tag.clone();
        tag.normalize_and_validate()?;
        self.durable.get_device(tag.device_id).await?;
        let created = self.durable.create_tag(&tag).await?;
        info!(
            device_id = created.device_id,
            tag_id = created.id,
            "Created tag '{}'",
            created.name
        );
        self.mirror_tag(created.id).await;
        self.reload(created.device_id).await;
        Ok(created)
    }

    pub async fn update_tag(&self, tag: &Tag) -> Result<Tag> {
        let mut tag = tag.clone();
        tag.normalize_and_validate()?;
        let previous = self.durable.get_tag(tag.id).await?;
        if previous.device_id != tag.device_id {
            self.durable.get_device(tag.device_id).await?;
        }
        let updated = self.durable.update_tag(&tag).await?;
        info!(
            device_id = updated.device_id,
            tag_id = updated.id,
            "Updated tag '{}'",
            updated.name
        );
        self.mirror_tag(updated.id).await;

        // A cached value decoded under the old address or type is stale
        if previous.address() != updated.address()
            || previous.data_type != updated.data_type
            || previous.device_id != updated.device_id
        {
            self.forget_value(previous.device_id, previous.id).await;
        }
        self.reload(updated.device_id).await;
        if previous.device_id != updated.device_id {
            self.reload(previous.device_id).await;
        }
        Ok(updated)
    }

    pub async fn delete_tag(&self, id: i64) -> Result<()> {
        let tag = self.durable.get_tag(id).await?;
        self.durable.delete_tag(id).await?;
        info!(device_id = tag.device_id, tag_id = id, "Deleted tag '{}'", tag.name);
        self.mirror_tag(id).await;
        self.forget_value(tag.device_id, id).await;
        self.reload(tag.device_id).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------

    /// Start the sync loop and the device manager
    pub async fn start_monitoring(&self) -> Result<()> {
        self.sync.start().await;
        self.manager.start().await
    }

    pub async fn stop_monitoring(&self) {
        self.manager.stop().await;
        self.sync.stop().await;
    }

    pub async fn write_tag_by_name(
        &self,
        tag_name: &str,
        value: &serde_json::Value,
    ) -> Result<TagValue> {
        self.manager.write_tag_by_name(tag_name, value).await
    }

    /// Latest cached value; `None` when nothing has been polled yet
    pub async fn get_tag_value(&self, device_id: i64, tag_id: i64) -> Result<Option<CachedValue>> {
        self.cache.get_tag_value(device_id, tag_id).await
    }

    pub async fn get_stats(&self) -> ServiceStats {
        ServiceStats {
            manager: self.manager.stats().await,
            sync: self.sync.stats().await,
        }
    }

    /// Check both stores, the cache and every monitored device
    ///
    /// The durable store being down is fatal; anything else degrades.
    pub async fn check_health(&self) -> HealthReport {
        let (durable, fast, cache, pings) = tokio::join!(
            self.durable.ping(),
            self.fast.ping(),
            self.cache.health_check(),
            self.manager.ping_devices(),
        );
        let durable_store = ComponentHealth::from_result(durable);
        let fast_store = ComponentHealth::from_result(fast);
        let cache = ComponentHealth::from_result(cache);
        let devices: Vec<DeviceHealth> = pings
            .into_iter()
            .map(|(device_id, result)| DeviceHealth {
                device_id,
                reachable: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            })
            .collect();

        let status = if !durable_store.healthy {
            HealthStatus::Unhealthy
        } else if !fast_store.healthy || !cache.healthy || devices.iter().any(|d| !d.reachable) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        if status != HealthStatus::Healthy {
            warn!("Health check: {:?}", status);
        }
        HealthReport {
            status,
            durable_store,
            fast_store,
            cache,
            devices,
        }
    }

    /// Force a device to reconnect, then resync its mirror entry
    pub async fn reset_connection(&self, device_id: i64) -> Result<()> {
        self.manager.reset_connection(device_id).await?;
        if let Err(e) = self.sync.sync_specific_device(device_id).await {
            warn!(device_id, "Mirror resync after reset failed: {}", e);
            self.sync.notify_device_change(device_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Mirror one device now, leaving it to the next sync pass on failure
    async fn mirror_device(&self, id: i64) {
        if let Err(e) = self.sync.sync_specific_device(id).await {
            warn!(device_id = id, "Mirror update deferred: {}", e);
            self.sync.notify_device_change(id);
        }
    }

    async fn mirror_tag(&self, id: i64) {
        if let Err(e) = self.sync.sync_specific_tag(id).await {
            warn!(tag_id = id, "Mirror update deferred: {}", e);
            self.sync.notify_tag_change(id);
        }
    }

    async fn forget_value(&self, device_id: i64, tag_id: i64) {
        if let Err(e) = self.cache.delete_tag_value(device_id, tag_id).await {
            warn!(device_id, tag_id, "Failed to drop cached value: {}", e);
        }
    }

    /// Restart a monitored device so tag changes apply immediately
    async fn reload(&self, device_id: i64) {
        if !self.manager.is_running().await {
            return;
        }
        if let Err(e) = self.manager.reload_device(device_id).await {
            warn!(device_id, "Device reload failed: {}", e);
        }
    }
}

/// Fast store first; a miss or failure falls back to the durable store
async fn read_through<T>(
    what: &str,
    fast: impl Future<Output = StoreResult<T>>,
    durable: impl Future<Output = StoreResult<T>>,
) -> Result<T> {
    match fast.await {
        Ok(value) => Ok(value),
        Err(e) => {
            debug!("Fast store miss for {} ({}), reading durable store", what, e);
            Ok(durable.await?)
        },
    }
}

/// Like [`read_through`], also treating an empty mirror list as a miss
async fn read_list_through<T>(
    what: &str,
    fast: impl Future<Output = StoreResult<Vec<T>>>,
    durable: impl Future<Output = StoreResult<Vec<T>>>,
) -> Result<Vec<T>> {
    match fast.await {
        Ok(items) if !items.is_empty() => Ok(items),
        Ok(_) => Ok(durable.await?),
        Err(e) => {
            debug!("Fast store failed for {} ({}), reading durable store", what, e);
            Ok(durable.await?)
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::model::{DataType, DeviceStatus};
    use crate::protocol::MemoryConnector;
    use crate::store::{RtdbConfigStore, SqliteStore};
    use common::sqlite::SqliteClient;
    use gateway_rtdb::{MemoryRtdb, Rtdb};
    use std::time::Duration;

    struct Fixture {
        durable: Arc<SqliteStore>,
        backend: Arc<MemoryRtdb>,
        fast: Arc<RtdbConfigStore>,
        connector: Arc<MemoryConnector>,
        service: DeviceTagService,
    }

    async fn fixture() -> Fixture {
        let sqlite = Arc::new(SqliteClient::in_memory().await.unwrap());
        let durable = Arc::new(SqliteStore::bootstrap(sqlite).await.unwrap());
        let backend = Arc::new(MemoryRtdb::new());
        let fast = Arc::new(RtdbConfigStore::new(backend.clone() as Arc<dyn Rtdb>, ""));
        let config = AppConfig::default();
        let cache = Arc::new(TagCache::new(
            backend.clone() as Arc<dyn Rtdb>,
            &config.cache,
        ));
        let connector = Arc::new(MemoryConnector::new());
        let service = DeviceTagService::new(
            durable.clone() as Arc<dyn ConfigStore>,
            fast.clone() as Arc<dyn ConfigStore>,
            cache,
            connector.clone() as Arc<dyn Connector>,
            &config,
        );
        Fixture {
            durable,
            backend,
            fast,
            connector,
            service,
        }
    }

    #[tokio::test]
    async fn test_create_device_validates_and_mirrors() {
        let f = fixture().await;
        let err = f
            .service
            .create_device(&Device::new("", "10.0.0.1", 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, PlcError::Validation(_)));
        assert!(f.durable.list_devices().await.unwrap().is_empty());

        let device = f
            .service
            .create_device(&Device::new("press", "10.0.0.1", 0, 1))
            .await
            .unwrap();
        assert_eq!(f.fast.get_device(device.id).await.unwrap().name, "press");
        assert_eq!(f.service.get_device(device.id).await.unwrap().id, device.id);
    }

    #[tokio::test]
    async fn test_reads_fall_back_to_durable_store() {
        let f = fixture().await;
        let device = f
            .durable
            .create_device(&Device::new("press", "10.0.0.1", 0, 1))
            .await
            .unwrap();

        assert_eq!(f.service.get_device(device.id).await.unwrap().name, "press");
        assert_eq!(f.service.list_devices().await.unwrap().len(), 1);

        f.backend.set_fail_reads(true);
        assert_eq!(f.service.list_active_devices().await.unwrap().len(), 1);
        assert!(f.service.get_device(404).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_tag_lifecycle() {
        let f = fixture().await;
        let device = f
            .service
            .create_device(&Device::new("press", "10.0.0.1", 0, 1))
            .await
            .unwrap();

        let tag = f
            .service
            .create_tag(&Tag::new(device.id, "speed", DataType::Int16, 1, 4, 5))
            .await
            .unwrap();
        assert_eq!(tag.bit_offset, 0);
        assert_eq!(f.fast.get_tag(tag.id).await.unwrap().name, "speed");
        assert_eq!(f.service.find_tags_by_name("speed").await.unwrap().len(), 1);

        let bad = Tag::new(device.id, "run", DataType::Bool, 1, 0, 9);
        assert!(matches!(
            f.service.create_tag(&bad).await.unwrap_err(),
            PlcError::Validation(_)
        ));
        let orphan = Tag::new(999, "x", DataType::UInt8, 1, 0, 0);
        assert!(f.service.create_tag(&orphan).await.unwrap_err().is_not_found());

        let mut renamed = tag.clone();
        renamed.name = "rpm".into();
        f.service.update_tag(&renamed).await.unwrap();
        assert!(f.fast.find_tags_by_name("speed").await.unwrap().is_empty());
        assert_eq!(f.service.get_tag(tag.id).await.unwrap().name, "rpm");

        let err = f.service.delete_device(device.id).await.unwrap_err();
        assert!(matches!(err, PlcError::Validation(_)));

        f.service.delete_tag(tag.id).await.unwrap();
        assert!(f.fast.get_tag(tag.id).await.unwrap_err().is_not_found());
        f.service.delete_device(device.id).await.unwrap();
        assert!(f.fast.get_device(device.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_monitoring_write_and_read_back() {
        let f = fixture().await;
        let plc = f.connector.add_device("plc-a");
        plc.memory.set_bytes(1, 0, &[0u8; 4]);
        let device = f
            .service
            .create_device(&Device::new("press", "plc-a", 0, 1))
            .await
            .unwrap();
        let mut setpoint = Tag::new(device.id, "setpoint", DataType::UInt16, 1, 0, 0);
        setpoint.can_write = true;
        setpoint.scan_rate_ms = 60_000;
        let setpoint = f.service.create_tag(&setpoint).await.unwrap();

        f.service.start_monitoring().await.unwrap();
        for _ in 0..200 {
            if f.durable.get_device(device.id).await.unwrap().status == DeviceStatus::Online {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = f
            .service
            .write_tag_by_name("setpoint", &serde_json::json!(70000))
            .await
            .unwrap_err();
        assert!(matches!(err, PlcError::Codec(_)));

        let written = f
            .service
            .write_tag_by_name("setpoint", &serde_json::json!(1234))
            .await
            .unwrap();
        assert_eq!(written, TagValue::UInt16(1234));
        let cached = f
            .service
            .get_tag_value(device.id, setpoint.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.tag_value().unwrap(), TagValue::UInt16(1234));

        let stats = f.service.get_stats().await;
        assert_eq!(stats.manager.devices.len(), 1);
        assert!(stats.sync.running);

        f.service.reset_connection(device.id).await.unwrap();
        assert_eq!(
            f.fast.get_device(device.id).await.unwrap().status,
            DeviceStatus::Reconnecting
        );

        f.service.stop_monitoring().await;
        assert!(!f.service.get_stats().await.manager.running);
    }

    #[tokio::test]
    async fn test_health_verdicts() {
        let f = fixture().await;
        assert_eq!(f.service.check_health().await.status, HealthStatus::Healthy);

        f.backend.set_fail_reads(true);
        let report = f.service.check_health().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.fast_store.healthy);
        assert!(report.durable_store.healthy);
        f.backend.set_fail_reads(false);

        f.durable.client().pool().close().await;
        assert_eq!(f.service.check_health().await.status, HealthStatus::Unhealthy);
    }
}
