//! Device manager
//!
//! Owns one supervisor task per active device. A supervisor connects once,
//! then runs one [`GroupPoller`] per distinct scan rate until its
//! cancellation token fires, joins them and closes the connection. A
//! discovery loop reconciles the running set against the active-device
//! roster on a fixed interval.

pub mod compare;
pub mod poller;

pub use poller::{GroupPoller, PollStats, PollStatsSnapshot, TickReport};

use crate::cache::TagCache;
use crate::config::{BreakerConfig, ConnectionConfig, ManagerConfig, RetryConfig};
use crate::device::{
    BreakerSnapshot, CircuitBreakerConfig, ConnectionState, DeviceConnection, ResilientClient,
    RetryPolicy,
};
use crate::error::{PlcError, Result};
use crate::model::{Device, DeviceStatus, Tag, TagValue};
use crate::protocol::{Connector, Endpoint};
use crate::store::ConfigStore;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Manager tuning, assembled from the service config sections
#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    pub manager: ManagerConfig,
    pub connection: ConnectionConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

// ============================================================================
// Status recording
// ============================================================================

/// Tracks one device's liveness and persists transitions
///
/// The durable store write is logged on failure; the mirror is best effort.
pub struct StatusRecorder {
    device_id: i64,
    current: parking_lot::Mutex<DeviceStatus>,
    durable: Arc<dyn ConfigStore>,
    fast: Arc<dyn ConfigStore>,
}

impl StatusRecorder {
    pub fn new(
        device_id: i64,
        initial: DeviceStatus,
        durable: Arc<dyn ConfigStore>,
        fast: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            device_id,
            current: parking_lot::Mutex::new(initial),
            durable,
            fast,
        }
    }

    pub fn current(&self) -> DeviceStatus {
        *self.current.lock()
    }

    /// Record `status`, persisting only actual transitions
    pub async fn set(&self, status: DeviceStatus) {
        self.apply(status, |_| true).await;
    }

    /// Derive liveness from a poll tick
    ///
    /// `Reconnecting` stays until the next supervisor reports its connect.
    pub async fn observe(&self, report: &TickReport) {
        let status = if report.read_ok > 0 {
            DeviceStatus::Online
        } else if report.unavailable {
            DeviceStatus::Offline
        } else {
            return;
        };
        self.apply(status, |current| current != DeviceStatus::Reconnecting)
            .await;
    }

    async fn apply(&self, status: DeviceStatus, allowed: impl FnOnce(DeviceStatus) -> bool) {
        let previous = {
            let mut current = self.current.lock();
            if !allowed(*current) {
                return;
            }
            std::mem::replace(&mut *current, status)
        };
        if previous == status {
            return;
        }
        info!(
            device_id = self.device_id,
            "Device status {} -> {}", previous, status
        );
        if let Err(e) = self.durable.set_device_status(self.device_id, status).await {
            error!(
                device_id = self.device_id,
                "Failed to persist status {}: {}", status, e
            );
        }
        if let Err(e) = self.fast.set_device_status(self.device_id, status).await {
            warn!(
                device_id = self.device_id,
                "Failed to mirror status {}: {}", status, e
            );
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

struct ManagedDevice {
    device: Device,
    tags: Vec<Tag>,
    groups: usize,
    client: Arc<ResilientClient>,
    stats: Arc<PollStats>,
    status: Arc<StatusRecorder>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// What one discovery pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub started: Vec<i64>,
    pub stopped: Vec<i64>,
    pub restarted: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStats {
    pub device_id: i64,
    pub name: String,
    pub status: DeviceStatus,
    pub connection: ConnectionState,
    pub breaker: BreakerSnapshot,
    pub groups: usize,
    pub tags: usize,
    pub polling: PollStatsSnapshot,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerStats {
    pub running: bool,
    pub devices: Vec<DeviceStats>,
    pub totals: PollStatsSnapshot,
}

pub struct DeviceManager {
    durable: Arc<dyn ConfigStore>,
    fast: Arc<dyn ConfigStore>,
    cache: Arc<TagCache>,
    connector: Arc<dyn Connector>,
    settings: ManagerSettings,
    devices: Mutex<HashMap<i64, ManagedDevice>>,
    root: parking_lot::Mutex<CancellationToken>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
    pub fn new(
        durable: Arc<dyn ConfigStore>,
        fast: Arc<dyn ConfigStore>,
        cache: Arc<TagCache>,
        connector: Arc<dyn Connector>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            durable,
            fast,
            cache,
            connector,
            settings,
            devices: Mutex::new(HashMap::new()),
            root: parking_lot::Mutex::new(CancellationToken::new()),
            discovery: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.discovery.lock().await.is_some()
    }

    /// Run one discovery pass, then keep discovering in the background
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut discovery = self.discovery.lock().await;
        if discovery.is_some() {
            return Ok(());
        }
        let token = {
            let mut root = self.root.lock();
            if root.is_cancelled() {
                *root = CancellationToken::new();
            }
            root.clone()
        };

        let summary = self.refresh_devices().await?;
        info!("Device manager started with {} devices", summary.started.len());

        let manager = Arc::clone(self);
        let period = self.settings.manager.discovery_interval();
        *discovery = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                if let Err(e) = manager.refresh_devices().await {
                    warn!("Device discovery failed: {}", e);
                }
            }
            debug!("Discovery loop stopped");
        }));
        Ok(())
    }

    /// Cancel everything and wait until every device task has finished
    pub async fn stop(&self) {
        self.root.lock().cancel();
        if let Some(handle) = self.discovery.lock().await.take() {
            let _ = handle.await;
        }
        let drained: Vec<ManagedDevice> = self.devices.lock().await.drain().map(|(_, d)| d).collect();
        let count = drained.len();
        for managed in drained {
            Self::stop_managed(managed).await;
        }
        info!("Device manager stopped ({} devices)", count);
    }

    /// Reconcile running devices against the active roster
    ///
    /// The roster comes from the fast store, falling back to the durable
    /// store when the mirror fails or lists nothing.
    pub async fn refresh_devices(&self) -> Result<RefreshSummary> {
        let roster = match self.fast.list_active_devices().await {
            Ok(devices) if !devices.is_empty() => devices,
            Ok(_) => {
                debug!("Fast store roster empty, using durable store");
                self.durable.list_active_devices().await?
            },
            Err(e) => {
                warn!("Fast store roster unavailable, using durable store: {}", e);
                self.durable.list_active_devices().await?
            },
        };
        let roster: BTreeMap<i64, Device> = roster.into_iter().map(|d| (d.id, d)).collect();

        let mut summary = RefreshSummary::default();
        let mut devices = self.devices.lock().await;

        let gone: Vec<i64> = devices
            .keys()
            .filter(|id| !roster.contains_key(id))
            .copied()
            .collect();
        for id in gone {
            if let Some(managed) = devices.remove(&id) {
                info!(device_id = id, "Device no longer active, stopping");
                Self::stop_managed(managed).await;
                summary.stopped.push(id);
            }
        }

        for (id, device) in roster {
            let restart = match devices.get(&id) {
                None => false,
                Some(managed) => {
                    let changed = managed.device.connection_changed(&device);
                    let reconnect = managed.status.current() == DeviceStatus::Reconnecting;
                    if !changed && !reconnect {
                        continue;
                    }
                    info!(
                        device_id = id,
                        "Restarting device ({})",
                        if changed { "connection changed" } else { "reconnect requested" }
                    );
                    true
                },
            };
            if let Some(old) = devices.remove(&id) {
                Self::stop_managed(old).await;
            }
            match self.start_device(device).await {
                Ok(managed) => {
                    devices.insert(id, managed);
                    if restart {
                        summary.restarted.push(id);
                    } else {
                        summary.started.push(id);
                    }
                },
                Err(e) => error!(device_id = id, "Failed to start device: {}", e),
            }
        }
        Ok(summary)
    }

    /// Restart one device so tag changes take effect now
    pub async fn reload_device(&self, device_id: i64) -> Result<()> {
        let mut devices = self.devices.lock().await;
        if let Some(old) = devices.remove(&device_id) {
            Self::stop_managed(old).await;
        }
        let device = match self.fast.get_device(device_id).await {
            Ok(device) => device,
            Err(e) => {
                debug!(device_id, "Fast store lookup failed, using durable store: {}", e);
                match self.durable.get_device(device_id).await {
                    Ok(device) => device,
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            },
        };
        if !device.active || self.root.lock().is_cancelled() {
            return Ok(());
        }
        let managed = self.start_device(device).await?;
        devices.insert(device_id, managed);
        debug!(device_id, "Device reloaded");
        Ok(())
    }

    /// Force-close a device's session and mark it for reconnection
    pub async fn reset_connection(&self, device_id: i64) -> Result<()> {
        let (client, status) = {
            let devices = self.devices.lock().await;
            let managed = devices
                .get(&device_id)
                .ok_or_else(|| PlcError::NotFound(format!("device {} is not monitored", device_id)))?;
            (managed.client.clone(), managed.status.clone())
        };
        client.reset().await;
        status.set(DeviceStatus::Reconnecting).await;
        info!(device_id, "Connection reset requested");
        Ok(())
    }

    /// Write a converted value to the first writable match among online devices
    ///
    /// Devices are searched in ascending id order.
    pub async fn write_tag_by_name(
        &self,
        tag_name: &str,
        input: &serde_json::Value,
    ) -> Result<TagValue> {
        let (device_id, tag, client) = {
            let devices = self.devices.lock().await;
            let mut ids: Vec<&i64> = devices.keys().collect();
            ids.sort_unstable();
            ids.into_iter()
                .filter_map(|id| devices.get(id))
                .filter(|m| m.device.active && m.status.current() == DeviceStatus::Online)
                .find_map(|m| {
                    m.tags
                        .iter()
                        .find(|t| t.active && t.name == tag_name)
                        .map(|t| (m.device.id, t.clone(), m.client.clone()))
                })
                .ok_or_else(|| {
                    PlcError::NotFound(format!("tag '{}' on any online device", tag_name))
                })?
        };

        if !tag.can_write {
            return Err(PlcError::WriteNotPermitted(tag.name));
        }
        let value = TagValue::convert(input, tag.data_type)?;
        let (db, byte, bit) = tag.address();
        client
            .write_tag(db, byte, bit, tag.data_type, &value)
            .await?;
        info!(device_id, tag_id = tag.id, "Wrote {} to '{}'", value, tag.name);

        if let Err(e) = self.cache.set_tag_value(device_id, tag.id, &value).await {
            warn!(device_id, tag_id = tag.id, "Cache update after write failed: {}", e);
        }
        Ok(value)
    }

    pub async fn stats(&self) -> ManagerStats {
        let running = self.is_running().await;
        let devices = self.devices.lock().await;
        let mut out = ManagerStats {
            running,
            ..Default::default()
        };
        for managed in devices.values() {
            let polling = managed.stats.snapshot();
            out.totals.accumulate(&polling);
            out.devices.push(DeviceStats {
                device_id: managed.device.id,
                name: managed.device.name.clone(),
                status: managed.status.current(),
                connection: managed.client.connection().state(),
                breaker: managed.client.breaker(),
                groups: managed.groups,
                tags: managed.tags.len(),
                polling,
            });
        }
        out.devices.sort_by_key(|d| d.device_id);
        out
    }

    /// Ping every managed device without touching its session
    pub async fn ping_devices(&self) -> Vec<(i64, Result<()>)> {
        let clients: Vec<(i64, Arc<ResilientClient>)> = {
            let devices = self.devices.lock().await;
            devices
                .iter()
                .map(|(id, m)| (*id, m.client.clone()))
                .collect()
        };
        let pings = clients.into_iter().map(|(id, client)| async move {
            (id, client.connection().ping().await)
        });
        let mut results = futures::future::join_all(pings).await;
        results.sort_by_key(|(id, _)| *id);
        results
    }

    pub async fn monitored_devices(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.devices.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    async fn load_tags(&self, device_id: i64) -> Result<Vec<Tag>> {
        match self.fast.list_tags_for_device(device_id).await {
            Ok(tags) if !tags.is_empty() => return Ok(tags),
            Ok(_) => {},
            Err(e) => debug!(device_id, "Fast store tags unavailable: {}", e),
        }
        Ok(self.durable.list_tags_for_device(device_id).await?)
    }

    async fn start_device(&self, device: Device) -> Result<ManagedDevice> {
        let endpoint = Endpoint::from_device(&device, self.settings.connection.default_port)?;
        let tags: Vec<Tag> = self
            .load_tags(device.id)
            .await?
            .into_iter()
            .filter(|t| t.active)
            .collect();

        let conn = Arc::new(DeviceConnection::new(
            endpoint,
            Arc::clone(&self.connector),
            &self.settings.connection,
        ));
        let client = Arc::new(ResilientClient::new(
            device.id,
            conn,
            RetryPolicy::from_config(&self.settings.retry),
            CircuitBreakerConfig::from(&self.settings.breaker),
        ));
        let stats = Arc::new(PollStats::default());
        let status = Arc::new(StatusRecorder::new(
            device.id,
            device.status,
            Arc::clone(&self.durable),
            Arc::clone(&self.fast),
        ));

        let mut by_rate: BTreeMap<i64, Vec<Tag>> = BTreeMap::new();
        for tag in &tags {
            by_rate.entry(tag.scan_rate_ms).or_default().push(tag.clone());
        }
        let pollers: Vec<GroupPoller> = by_rate
            .into_iter()
            .map(|(rate, group)| {
                GroupPoller::new(
                    device.id,
                    Duration::from_millis(rate.max(1) as u64),
                    group,
                    Arc::clone(&client),
                    Arc::clone(&self.cache),
                    Arc::clone(&stats),
                )
            })
            .collect();
        let groups = pollers.len();

        let token = self.root.lock().child_token();
        let handle = tokio::spawn(supervise(
            device.id,
            Arc::clone(&client),
            pollers,
            Arc::clone(&status),
            token.clone(),
        ));

        info!(
            device_id = device.id,
            "Monitoring '{}' at {}: {} tags in {} groups",
            device.name,
            device.address,
            tags.len(),
            groups
        );
        Ok(ManagedDevice {
            device,
            tags,
            groups,
            client,
            stats,
            status,
            token,
            handle,
        })
    }

    async fn stop_managed(managed: ManagedDevice) {
        managed.token.cancel();
        if let Err(e) = managed.handle.await {
            error!(device_id = managed.device.id, "Device task panicked: {}", e);
        }
    }
}

/// Per-device task: connect, run the group pollers, drain, disconnect
async fn supervise(
    device_id: i64,
    client: Arc<ResilientClient>,
    pollers: Vec<GroupPoller>,
    status: Arc<StatusRecorder>,
    token: CancellationToken,
) {
    let connected = tokio::select! {
        _ = token.cancelled() => None,
        result = client.connect() => Some(result),
    };
    match connected {
        None => return,
        Some(Ok(())) => status.set(DeviceStatus::Online).await,
        Some(Err(e)) => {
            warn!(device_id, "Initial connect failed: {}", e);
            status.set(DeviceStatus::Offline).await;
        },
    }

    let mut tasks = JoinSet::new();
    for poller in pollers {
        tasks.spawn(poller.run(Arc::clone(&status), token.child_token()));
    }

    token.cancelled().await;
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(device_id, "Poller task failed: {}", e);
        }
    }
    client.close().await;
    debug!(device_id, "Device supervisor finished");
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::model::DataType;
    use crate::protocol::MemoryConnector;
    use crate::store::{RtdbConfigStore, SqliteStore};
    use common::sqlite::SqliteClient;
    use gateway_rtdb::{MemoryRtdb, Rtdb};

    struct Fixture {
        durable: Arc<SqliteStore>,
        fast_backend: Arc<MemoryRtdb>,
        fast: Arc<RtdbConfigStore>,
        connector: Arc<MemoryConnector>,
        cache: Arc<TagCache>,
        manager: Arc<DeviceManager>,
    }

    async fn fixture() -> Fixture {
        let sqlite = Arc::new(SqliteClient::in_memory().await.unwrap());
        let durable = Arc::new(SqliteStore::bootstrap(sqlite).await.unwrap());
        let fast_backend = Arc::new(MemoryRtdb::new());
        let fast = Arc::new(RtdbConfigStore::new(fast_backend.clone() as Arc<dyn Rtdb>, ""));
        let cache = Arc::new(TagCache::new(
            Arc::new(MemoryRtdb::new()) as Arc<dyn Rtdb>,
            &CacheConfig::default(),
        ));
        let connector = Arc::new(MemoryConnector::new());
        let manager = Arc::new(DeviceManager::new(
            durable.clone() as Arc<dyn ConfigStore>,
            fast.clone() as Arc<dyn ConfigStore>,
            cache.clone(),
            connector.clone() as Arc<dyn Connector>,
            ManagerSettings::default(),
        ));
        Fixture {
            durable,
            fast_backend,
            fast,
            connector,
            cache,
            manager,
        }
    }

    /// Create in the durable store and mirror, like a full sync would
    async fn add_device(f: &Fixture, name: &str, host: &str) -> Device {
        let device = f
            .durable
            .create_device(&Device::new(name, host, 0, 1))
            .await
            .unwrap();
        f.fast.create_device(&device).await.unwrap();
        device
    }

    async fn add_tag(f: &Fixture, mut tag: Tag) -> Tag {
        tag.normalize_and_validate().unwrap();
        let tag = f.durable.create_tag(&tag).await.unwrap();
        f.fast.create_tag(&tag).await.unwrap();
        tag
    }

    async fn wait_for_status(f: &Fixture, id: i64, status: DeviceStatus) {
        for _ in 0..200 {
            if f.durable.get_device(id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("device {} never reached {}", id, status);
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_refresh_starts_and_stops_devices() {
        let f = fixture().await;
        f.connector.add_device("plc-a");
        let d1 = add_device(&f, "d1", "plc-a").await;
        let d2 = add_device(&f, "d2", "plc-b").await;

        let summary = f.manager.refresh_devices().await.unwrap();
        assert_eq!(summary.started, vec![d1.id, d2.id]);
        wait_for_status(&f, d1.id, DeviceStatus::Online).await;
        wait_for_status(&f, d2.id, DeviceStatus::Offline).await;

        let mut inactive = d2.clone();
        inactive.active = false;
        f.fast.update_device(&inactive).await.unwrap();
        let summary = f.manager.refresh_devices().await.unwrap();
        assert_eq!(summary.stopped, vec![d2.id]);
        assert_eq!(f.manager.monitored_devices().await, vec![d1.id]);

        f.manager.stop().await;
        assert!(f.manager.monitored_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_connection_change_restarts_device() {
        let f = fixture().await;
        f.connector.add_device("plc-a");
        let plc_b = f.connector.add_device("plc-b");
        let d1 = add_device(&f, "d1", "plc-a").await;
        f.manager.refresh_devices().await.unwrap();

        let mut moved = d1.clone();
        moved.address = "plc-b".into();
        f.fast.update_device(&moved).await.unwrap();
        let summary = f.manager.refresh_devices().await.unwrap();
        assert_eq!(summary.restarted, vec![d1.id]);

        wait_until(|| plc_b.connect_count() == 1).await;

        // Unchanged roster is a no-op
        let summary = f.manager.refresh_devices().await.unwrap();
        assert_eq!(summary, RefreshSummary::default());
        f.manager.stop().await;
    }

    #[tokio::test]
    async fn test_roster_falls_back_to_durable_store() {
        let f = fixture().await;
        f.connector.add_device("plc-a");
        let device = f
            .durable
            .create_device(&Device::new("d1", "plc-a", 0, 1))
            .await
            .unwrap();
        // An empty mirror is not an authoritative roster
        assert_eq!(
            f.manager.refresh_devices().await.unwrap().started,
            vec![device.id]
        );
        wait_for_status(&f, device.id, DeviceStatus::Online).await;

        f.fast_backend.set_fail_reads(true);
        assert_eq!(
            f.manager.refresh_devices().await.unwrap(),
            RefreshSummary::default()
        );
        f.fast_backend.set_fail_reads(false);

        // Deactivation in the durable store still stops the device
        let mut inactive = f.durable.get_device(device.id).await.unwrap();
        inactive.active = false;
        f.durable.update_device(&inactive).await.unwrap();
        assert_eq!(
            f.manager.refresh_devices().await.unwrap().stopped,
            vec![device.id]
        );
        assert!(f.manager.monitored_devices().await.is_empty());
        f.manager.stop().await;
    }

    #[tokio::test]
    async fn test_poll_tick_does_not_clear_reconnecting() {
        let f = fixture().await;
        let device = add_device(&f, "d1", "plc-a").await;
        let status = StatusRecorder::new(
            device.id,
            DeviceStatus::Online,
            f.durable.clone() as Arc<dyn ConfigStore>,
            f.fast.clone() as Arc<dyn ConfigStore>,
        );
        status.set(DeviceStatus::Reconnecting).await;

        let ok = TickReport {
            read_ok: 1,
            ..Default::default()
        };
        status.observe(&ok).await;
        assert_eq!(status.current(), DeviceStatus::Reconnecting);
        let unavailable = TickReport {
            unavailable: true,
            ..Default::default()
        };
        status.observe(&unavailable).await;
        assert_eq!(
            f.durable.get_device(device.id).await.unwrap().status,
            DeviceStatus::Reconnecting
        );

        // The restarted supervisor clears it after connecting
        status.set(DeviceStatus::Online).await;
        status.observe(&unavailable).await;
        assert_eq!(status.current(), DeviceStatus::Offline);
        assert_eq!(
            f.fast.get_device(device.id).await.unwrap().status,
            DeviceStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_write_tag_by_name() {
        let f = fixture().await;
        let plc = f.connector.add_device("plc-a");
        plc.memory.set_bytes(1, 0, &[0u8; 8]);
        let d1 = add_device(&f, "d1", "plc-a").await;

        let mut setpoint = Tag::new(d1.id, "setpoint", DataType::Int16, 1, 2, 0);
        setpoint.can_write = true;
        setpoint.scan_rate_ms = 60_000;
        let setpoint = add_tag(&f, setpoint).await;
        let mut locked = Tag::new(d1.id, "locked", DataType::UInt16, 1, 4, 0);
        locked.scan_rate_ms = 60_000;
        add_tag(&f, locked).await;

        f.manager.refresh_devices().await.unwrap();
        wait_for_status(&f, d1.id, DeviceStatus::Online).await;

        let written = f
            .manager
            .write_tag_by_name("setpoint", &serde_json::json!("42"))
            .await
            .unwrap();
        assert_eq!(written, TagValue::Int16(42));
        assert_eq!(plc.memory.bytes(1, 2, 2).unwrap(), vec![0x00, 0x2A]);
        let cached = f.cache.get_tag_value(d1.id, setpoint.id).await.unwrap().unwrap();
        assert_eq!(cached.tag_value().unwrap(), TagValue::Int16(42));

        let err = f
            .manager
            .write_tag_by_name("locked", &serde_json::json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PlcError::WriteNotPermitted(_)));

        let err = f
            .manager
            .write_tag_by_name("missing", &serde_json::json!(1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        f.manager.stop().await;
    }

    #[tokio::test]
    async fn test_reset_connection_marks_reconnecting_then_restarts() {
        let f = fixture().await;
        let plc = f.connector.add_device("plc-a");
        let d1 = add_device(&f, "d1", "plc-a").await;
        f.manager.refresh_devices().await.unwrap();
        wait_for_status(&f, d1.id, DeviceStatus::Online).await;

        f.manager.reset_connection(d1.id).await.unwrap();
        assert_eq!(
            f.durable.get_device(d1.id).await.unwrap().status,
            DeviceStatus::Reconnecting
        );

        let summary = f.manager.refresh_devices().await.unwrap();
        assert_eq!(summary.restarted, vec![d1.id]);
        wait_for_status(&f, d1.id, DeviceStatus::Online).await;
        assert_eq!(plc.connect_count(), 2);

        assert!(f.manager.reset_connection(999).await.unwrap_err().is_not_found());
        f.manager.stop().await;
    }

    #[tokio::test]
    async fn test_stats_report_devices() {
        let f = fixture().await;
        f.connector.add_device("plc-a");
        let d1 = add_device(&f, "d1", "plc-a").await;
        let mut t = Tag::new(d1.id, "a", DataType::UInt8, 1, 0, 0);
        t.scan_rate_ms = 500;
        add_tag(&f, t).await;
        let mut t = Tag::new(d1.id, "b", DataType::UInt8, 1, 1, 0);
        t.scan_rate_ms = 1000;
        add_tag(&f, t).await;

        f.manager.start().await.unwrap();
        let stats = f.manager.stats().await;
        assert!(stats.running);
        assert_eq!(stats.devices.len(), 1);
        assert_eq!(stats.devices[0].groups, 2);
        assert_eq!(stats.devices[0].tags, 2);

        f.manager.stop().await;
        assert!(!f.manager.stats().await.running);
    }
}
