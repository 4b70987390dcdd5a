//! Dual-store synchronisation
//!
//! Keeps the fast-access mirror consistent with the durable store. A full
//! pass upserts every durable device and tag into the mirror and prunes
//! mirror entries the durable store no longer has. An incremental pass only
//! touches ids reported by the durable store as modified since the previous
//! pass (widened by a short overlap), plus ids flagged through
//! [`SyncService::notify_device_change`] / [`SyncService::notify_tag_change`].
//! It turns into a full pass when the mirror has visibly lost entries.

use crate::config::SyncConfig;
use crate::error::{PlcError, Result};
use crate::model::{Device, Tag};
use crate::store::{ConfigStore, StoreResult};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Change tracking
// ============================================================================

/// Ids modified since the last reconciliation
#[derive(Debug, Default)]
pub struct ChangeTracker {
    devices: parking_lot::Mutex<HashSet<i64>>,
    tags: parking_lot::Mutex<HashSet<i64>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_device(&self, id: i64) {
        self.devices.lock().insert(id);
    }

    pub fn mark_tag(&self, id: i64) {
        self.tags.lock().insert(id);
    }

    /// Drain both dirty sets
    pub fn take(&self) -> (HashSet<i64>, HashSet<i64>) {
        (
            std::mem::take(&mut *self.devices.lock()),
            std::mem::take(&mut *self.tags.lock()),
        )
    }

    /// Put ids back after a failed reconciliation
    pub fn restore(&self, devices: impl IntoIterator<Item = i64>, tags: impl IntoIterator<Item = i64>) {
        self.devices.lock().extend(devices);
        self.tags.lock().extend(tags);
    }

    /// `(dirty devices, dirty tags)`
    pub fn pending(&self) -> (usize, usize) {
        (self.devices.lock().len(), self.tags.lock().len())
    }
}

// ============================================================================
// Sync service
// ============================================================================

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Whether the pass reconciled everything
    pub full: bool,
    pub devices: usize,
    pub tags: usize,
    /// Mirror entries deleted because the durable store lacks them
    pub removed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub running: bool,
    pub full_syncs: u64,
    pub incremental_syncs: u64,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_incremental_sync: Option<DateTime<Utc>>,
    pub devices_synced: u64,
    pub tags_synced: u64,
    pub last_error_count: usize,
    pub pending_devices: usize,
    pub pending_tags: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Entity {
    Device(i64),
    Tag(i64),
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Device(id) => write!(f, "device {}", id),
            Entity::Tag(id) => write!(f, "tag {}", id),
        }
    }
}

pub struct SyncService {
    durable: Arc<dyn ConfigStore>,
    fast: Arc<dyn ConfigStore>,
    config: SyncConfig,
    tracker: ChangeTracker,
    last_sync: parking_lot::Mutex<Option<DateTime<Utc>>>,
    stats: parking_lot::Mutex<SyncStats>,
    /// Serialises reconciliation passes
    pass: tokio::sync::Mutex<()>,
    task: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SyncService {
    pub fn new(durable: Arc<dyn ConfigStore>, fast: Arc<dyn ConfigStore>, config: SyncConfig) -> Self {
        Self {
            durable,
            fast,
            config,
            tracker: ChangeTracker::new(),
            last_sync: parking_lot::Mutex::new(None),
            stats: parking_lot::Mutex::new(SyncStats::default()),
            pass: tokio::sync::Mutex::new(()),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn notify_device_change(&self, id: i64) {
        self.tracker.mark_device(id);
    }

    pub fn notify_tag_change(&self, id: i64) {
        self.tracker.mark_tag(id);
    }

    /// Optionally reconcile once, then reconcile incrementally on a timer
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        if self.config.sync_on_startup {
            match self.full_sync().await {
                Ok(report) => info!(
                    "Startup sync: {} devices, {} tags, {} removed",
                    report.devices, report.tags, report.removed
                ),
                Err(e) => warn!("Startup sync incomplete: {}", e),
            }
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let service = Arc::clone(self);
        let period = self.config.interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                if let Err(e) = service.incremental_sync().await {
                    warn!("Periodic sync incomplete: {}", e);
                }
            }
            debug!("Sync loop stopped");
        });
        *task = Some((token, handle));
        info!("Sync service started, interval {:?}", period);
    }

    pub async fn stop(&self) {
        if let Some((token, handle)) = self.task.lock().await.take() {
            token.cancel();
            let _ = handle.await;
            info!("Sync service stopped");
        }
    }

    pub async fn stats(&self) -> SyncStats {
        let running = self.task.lock().await.is_some();
        let (pending_devices, pending_tags) = self.tracker.pending();
        SyncStats {
            running,
            pending_devices,
            pending_tags,
            ..self.stats.lock().clone()
        }
    }

    /// Reconcile every device and tag, pruning mirror extras
    pub async fn full_sync(&self) -> Result<SyncReport> {
        let _pass = self.pass.lock().await;
        self.full_sync_locked().await
    }

    /// Reconcile only what changed since the previous pass
    ///
    /// Without a previous pass, or once the change set exceeds the configured
    /// thresholds, this becomes a full pass.
    pub async fn incremental_sync(&self) -> Result<SyncReport> {
        let _pass = self.pass.lock().await;
        let last_sync = *self.last_sync.lock();
        let Some(since) = last_sync else {
            debug!("No previous sync, running full reconciliation");
            return self.full_sync_locked().await;
        };
        if self.mirror_diverged().await {
            info!("Mirror out of step with durable store, running full reconciliation");
            return self.full_sync_locked().await;
        }
        let started = Utc::now();
        let window = since - self.config.change_overlap();

        let (mut devices, mut tags) = self.tracker.take();
        let modified = async {
            let d = self.durable.devices_modified_since(window).await?;
            let t = self.durable.tags_modified_since(window).await?;
            StoreResult::Ok((d, t))
        }
        .await;
        match modified {
            Ok((d, t)) => {
                devices.extend(d);
                tags.extend(t);
            },
            Err(e) => {
                self.tracker.restore(devices, tags);
                return Err(e.into());
            },
        }

        if devices.len() > self.config.full_sync_device_threshold
            || tags.len() > self.config.full_sync_tag_threshold
        {
            info!(
                "{} devices / {} tags changed, falling back to full sync",
                devices.len(),
                tags.len()
            );
            return self.full_sync_locked().await;
        }
        if devices.is_empty() && tags.is_empty() {
            *self.last_sync.lock() = Some(started);
            self.record(false, started, 0, 0, 0);
            return Ok(SyncReport::default());
        }

        // Devices before tags so a new tag's device is mirrored first
        let devices: BTreeSet<i64> = devices.into_iter().collect();
        let tags: BTreeSet<i64> = tags.into_iter().collect();
        let total = devices.len() + tags.len();
        let mut failures = self
            .reconcile(devices.iter().map(|id| Entity::Device(*id)).collect())
            .await;
        failures.extend(
            self.reconcile(tags.iter().map(|id| Entity::Tag(*id)).collect())
                .await,
        );

        let report = SyncReport {
            full: false,
            devices: devices.len(),
            tags: tags.len(),
            removed: 0,
        };
        self.finish(false, started, &report, failures, total)
    }

    /// Whether the mirror lost entries an incremental pass would not resend
    ///
    /// A mirror that cannot be listed is left to the per-entity upserts.
    async fn mirror_diverged(&self) -> bool {
        let (Ok(fast_devices), Ok(durable_devices)) =
            (self.fast.list_devices().await, self.durable.list_devices().await)
        else {
            return false;
        };
        if fast_devices.len() != durable_devices.len() {
            return true;
        }
        match (self.fast.list_tags().await, self.durable.list_tags().await) {
            (Ok(fast_tags), Ok(durable_tags)) => fast_tags.is_empty() && !durable_tags.is_empty(),
            _ => false,
        }
    }

    /// Reconcile one device from the durable store into the mirror
    ///
    /// A device missing from the durable store is deleted from the mirror.
    pub async fn sync_specific_device(&self, id: i64) -> Result<()> {
        self.sync_entity(Entity::Device(id)).await
    }

    /// Reconcile one tag from the durable store into the mirror
    pub async fn sync_specific_tag(&self, id: i64) -> Result<()> {
        self.sync_entity(Entity::Tag(id)).await
    }

    async fn full_sync_locked(&self) -> Result<SyncReport> {
        let started = Utc::now();
        let (dirty_devices, dirty_tags) = self.tracker.take();

        let listed = async {
            let devices = self.durable.list_devices().await?;
            let tags = self.durable.list_tags().await?;
            StoreResult::Ok((devices, tags))
        }
        .await;
        let (devices, tags) = match listed {
            Ok(listed) => listed,
            Err(e) => {
                self.tracker.restore(dirty_devices, dirty_tags);
                return Err(e.into());
            },
        };
        info!("Full sync: {} devices, {} tags", devices.len(), tags.len());

        let device_ids: HashSet<i64> = devices.iter().map(|d| d.id).collect();
        let tag_ids: HashSet<i64> = tags.iter().map(|t| t.id).collect();

        let mut failures = Vec::new();
        failures.extend(
            self.fan_out(devices, move |d| async move {
                let result = self.upsert_device(&d).await;
                (Entity::Device(d.id), result)
            })
            .await,
        );
        failures.extend(
            self.fan_out(tags, move |t| async move {
                let result = self.upsert_tag(&t).await;
                (Entity::Tag(t.id), result)
            })
            .await,
        );

        let (removed, prune_failures) = self.prune(&device_ids, &tag_ids).await;
        failures.extend(prune_failures);

        let report = SyncReport {
            full: true,
            devices: device_ids.len(),
            tags: tag_ids.len(),
            removed,
        };
        let total = report.devices + report.tags + removed;
        self.finish(true, started, &report, failures, total)
    }

    /// Delete mirror entries the durable store no longer has
    async fn prune(
        &self,
        device_ids: &HashSet<i64>,
        tag_ids: &HashSet<i64>,
    ) -> (usize, Vec<(Entity, PlcError)>) {
        let mut removed = 0;
        let mut failures = Vec::new();

        // Tags first: deleting a device drops its tag index
        match self.fast.list_tags().await {
            Ok(mirror) => {
                for tag in mirror.into_iter().filter(|t| !tag_ids.contains(&t.id)) {
                    match self.fast.delete_tag(tag.id).await {
                        Ok(()) => removed += 1,
                        Err(e) if e.is_not_found() => {},
                        Err(e) => failures.push((Entity::Tag(tag.id), e.into())),
                    }
                }
            },
            Err(e) => warn!("Cannot list mirrored tags for pruning: {}", e),
        }
        match self.fast.list_devices().await {
            Ok(mirror) => {
                for device in mirror.into_iter().filter(|d| !device_ids.contains(&d.id)) {
                    match self.fast.delete_device(device.id).await {
                        Ok(()) => removed += 1,
                        Err(e) if e.is_not_found() => {},
                        Err(e) => failures.push((Entity::Device(device.id), e.into())),
                    }
                }
            },
            Err(e) => warn!("Cannot list mirrored devices for pruning: {}", e),
        }
        if removed > 0 {
            info!("Pruned {} stale mirror entries", removed);
        }
        (removed, failures)
    }

    async fn reconcile(&self, entities: Vec<Entity>) -> Vec<(Entity, PlcError)> {
        self.fan_out(entities, move |entity| async move {
            (entity, self.sync_entity(entity).await)
        })
        .await
    }

    /// Run `op` over `items` with bounded parallelism, keeping the failures
    ///
    /// Items are owned so the resulting future stays `Send` inside spawned
    /// tasks.
    async fn fan_out<I, F, Fut>(&self, items: I, op: F) -> Vec<(Entity, PlcError)>
    where
        I: IntoIterator + Send,
        I::IntoIter: Send,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> Fut + Send,
        Fut: std::future::Future<Output = (Entity, Result<()>)> + Send,
    {
        stream::iter(items)
            .map(op)
            .buffer_unordered(self.config.max_parallel.max(1))
            .filter_map(|(entity, result)| async move { result.err().map(|e| (entity, e)) })
            .collect()
            .await
    }

    async fn sync_entity(&self, entity: Entity) -> Result<()> {
        match entity {
            Entity::Device(id) => match self.durable.get_device(id).await {
                Ok(device) => self.upsert_device(&device).await,
                Err(e) if e.is_not_found() => {
                    debug!(device_id = id, "Device gone from durable store, removing mirror");
                    ignore_not_found(self.fast.delete_device(id).await)
                },
                Err(e) => Err(e.into()),
            },
            Entity::Tag(id) => match self.durable.get_tag(id).await {
                Ok(tag) => self.upsert_tag(&tag).await,
                Err(e) if e.is_not_found() => {
                    debug!(tag_id = id, "Tag gone from durable store, removing mirror");
                    ignore_not_found(self.fast.delete_tag(id).await)
                },
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn upsert_device(&self, device: &Device) -> Result<()> {
        match self.fast.update_device(device).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                self.fast.create_device(device).await?;
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_tag(&self, tag: &Tag) -> Result<()> {
        match self.fast.update_tag(tag).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                self.fast.create_tag(tag).await?;
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Record the pass, re-flag failed ids and aggregate their errors
    fn finish(
        &self,
        full: bool,
        started: DateTime<Utc>,
        report: &SyncReport,
        mut failures: Vec<(Entity, PlcError)>,
        total: usize,
    ) -> Result<SyncReport> {
        *self.last_sync.lock() = Some(started);
        self.record(full, started, report.devices, report.tags, failures.len());
        if failures.is_empty() {
            debug!(
                "Sync pass done (full: {}): {} devices, {} tags",
                full, report.devices, report.tags
            );
            return Ok(report.clone());
        }

        failures.sort_by_key(|(entity, _)| *entity);
        for (entity, e) in &failures {
            warn!("Failed to sync {}: {}", entity, e);
            match entity {
                Entity::Device(id) => self.tracker.mark_device(*id),
                Entity::Tag(id) => self.tracker.mark_tag(*id),
            }
        }
        let messages: Vec<String> = failures
            .iter()
            .map(|(entity, e)| format!("{}: {}", entity, e))
            .collect();
        Err(PlcError::partial(total, &messages))
    }

    fn record(&self, full: bool, at: DateTime<Utc>, devices: usize, tags: usize, errors: usize) {
        let mut stats = self.stats.lock();
        if full {
            stats.full_syncs += 1;
            stats.last_full_sync = Some(at);
        } else {
            stats.incremental_syncs += 1;
            stats.last_incremental_sync = Some(at);
        }
        stats.devices_synced += devices as u64;
        stats.tags_synced += tags as u64;
        stats.last_error_count = errors;
    }
}

fn ignore_not_found(result: StoreResult<()>) -> Result<()> {
    match result {
        Err(e) if !e.is_not_found() => Err(e.into()),
        _ => Ok(()),
    }
}
