//! Per scan-rate group polling

use super::compare::values_equal;
use super::StatusRecorder;
use crate::cache::{TagCache, TagKey};
use crate::device::ResilientClient;
use crate::model::{Tag, TagValue};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polling counters shared by all groups of one device
#[derive(Debug, Default)]
pub struct PollStats {
    ticks: AtomicU64,
    reads_ok: AtomicU64,
    reads_failed: AtomicU64,
    cache_writes: AtomicU64,
    skipped_unchanged: AtomicU64,
    last_poll_ms: AtomicI64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStatsSnapshot {
    pub ticks: u64,
    pub reads_ok: u64,
    pub reads_failed: u64,
    pub cache_writes: u64,
    pub skipped_unchanged: u64,
    /// Milliseconds since the Unix epoch, absent before the first tick
    pub last_poll_ms: Option<i64>,
}

impl PollStats {
    fn record(&self, report: &TickReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.reads_ok
            .fetch_add(report.read_ok as u64, Ordering::Relaxed);
        self.reads_failed
            .fetch_add(report.read_failed as u64, Ordering::Relaxed);
        self.cache_writes
            .fetch_add(report.written as u64, Ordering::Relaxed);
        self.skipped_unchanged
            .fetch_add(report.skipped as u64, Ordering::Relaxed);
        self.last_poll_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PollStatsSnapshot {
        let last = self.last_poll_ms.load(Ordering::Relaxed);
        PollStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            reads_ok: self.reads_ok.load(Ordering::Relaxed),
            reads_failed: self.reads_failed.load(Ordering::Relaxed),
            cache_writes: self.cache_writes.load(Ordering::Relaxed),
            skipped_unchanged: self.skipped_unchanged.load(Ordering::Relaxed),
            last_poll_ms: (last > 0).then_some(last),
        }
    }
}

impl PollStatsSnapshot {
    /// Fold another snapshot into a running total
    pub fn accumulate(&mut self, other: &PollStatsSnapshot) {
        self.ticks += other.ticks;
        self.reads_ok += other.reads_ok;
        self.reads_failed += other.reads_failed;
        self.cache_writes += other.cache_writes;
        self.skipped_unchanged += other.skipped_unchanged;
        self.last_poll_ms = self.last_poll_ms.max(other.last_poll_ms);
    }
}

/// Outcome of one group tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub read_ok: usize,
    pub read_failed: usize,
    pub written: usize,
    pub skipped: usize,
    /// At least one read failed because the device could not be reached
    pub unavailable: bool,
}

struct PolledTag {
    tag: Tag,
    last: Option<TagValue>,
}

/// Polls one device's tags sharing a scan rate
pub struct GroupPoller {
    device_id: i64,
    scan_rate: Duration,
    tags: Vec<PolledTag>,
    client: Arc<ResilientClient>,
    cache: Arc<TagCache>,
    stats: Arc<PollStats>,
    seeded: bool,
    failing: bool,
}

impl GroupPoller {
    /// Tags are polled in ascending id order every tick
    pub fn new(
        device_id: i64,
        scan_rate: Duration,
        mut tags: Vec<Tag>,
        client: Arc<ResilientClient>,
        cache: Arc<TagCache>,
        stats: Arc<PollStats>,
    ) -> Self {
        tags.sort_by_key(|t| t.id);
        Self {
            device_id,
            scan_rate,
            tags: tags
                .into_iter()
                .map(|tag| PolledTag { tag, last: None })
                .collect(),
            client,
            cache,
            stats,
            seeded: false,
            failing: false,
        }
    }

    pub fn scan_rate(&self) -> Duration {
        self.scan_rate
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Load last values already in the cache so a restart does not rewrite
    /// unchanged tags
    async fn seed_from_cache(&mut self) {
        self.seeded = true;
        let keys: Vec<TagKey> = self
            .tags
            .iter()
            .filter(|p| p.tag.monitor_changes)
            .map(|p| (self.device_id, p.tag.id))
            .collect();
        let cached = match self.cache.batch_get(&keys).await {
            Ok(cached) => cached,
            Err(e) => {
                debug!(device_id = self.device_id, "Cache seed skipped: {}", e);
                return;
            },
        };
        for polled in &mut self.tags {
            if let Some(entry) = cached.get(&(self.device_id, polled.tag.id)) {
                polled.last = entry.tag_value().ok();
            }
        }
    }

    /// Read every tag once and push changes to the cache
    pub async fn poll_once(&mut self) -> TickReport {
        if !self.seeded {
            self.seed_from_cache().await;
        }

        let mut report = TickReport::default();
        let mut first_error = None;
        for polled in &mut self.tags {
            let (db, byte, bit) = polled.tag.address();
            let value = match self
                .client
                .read_tag(db, byte, bit, polled.tag.data_type)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    report.read_failed += 1;
                    report.unavailable |= e.is_device_unavailable();
                    debug!(
                        device_id = self.device_id,
                        tag_id = polled.tag.id,
                        "Read of '{}' failed: {}",
                        polled.tag.name,
                        e
                    );
                    first_error.get_or_insert(e);
                    continue;
                },
            };
            report.read_ok += 1;

            let unchanged = polled.tag.monitor_changes
                && polled
                    .last
                    .as_ref()
                    .is_some_and(|last| values_equal(last, &value));
            if unchanged {
                report.skipped += 1;
                continue;
            }

            match self
                .cache
                .set_tag_value(self.device_id, polled.tag.id, &value)
                .await
            {
                Ok(()) => {
                    report.written += 1;
                    polled.last = Some(value);
                },
                Err(e) => warn!(
                    device_id = self.device_id,
                    tag_id = polled.tag.id,
                    "Cache write failed: {}",
                    e
                ),
            }
        }

        match (&first_error, self.failing) {
            (Some(e), false) => warn!(
                device_id = self.device_id,
                "{} of {} reads failed in {:?} group: {}",
                report.read_failed,
                self.tags.len(),
                self.scan_rate,
                e
            ),
            (None, true) => info!(
                device_id = self.device_id,
                "Reads recovered in {:?} group", self.scan_rate
            ),
            _ => {},
        }
        self.failing = first_error.is_some();

        self.stats.record(&report);
        report
    }

    /// Tick until cancelled
    pub async fn run(mut self, status: Arc<StatusRecorder>, token: CancellationToken) {
        let mut ticker = interval(self.scan_rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(
            device_id = self.device_id,
            "Polling {} tags every {:?}",
            self.tags.len(),
            self.scan_rate
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {},
            }
            tokio::select! {
                _ = token.cancelled() => break,
                report = self.poll_once() => status.observe(&report).await,
            }
        }
        debug!(device_id = self.device_id, "{:?} group stopped", self.scan_rate);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ConnectionConfig};
    use crate::device::{CircuitBreakerConfig, DeviceConnection, RetryPolicy};
    use crate::model::DataType;
    use crate::protocol::{Connector, Endpoint, MemoryConnector, SimulatedPlc};
    use gateway_rtdb::{MemoryRtdb, Rtdb};
    use tracing_test::traced_test;

    struct Fixture {
        plc: Arc<SimulatedPlc>,
        rtdb: Arc<MemoryRtdb>,
        cache: Arc<TagCache>,
        client: Arc<ResilientClient>,
    }

    fn fixture() -> Fixture {
        let connector = Arc::new(MemoryConnector::new());
        let plc = connector.add_device("plc-a");
        plc.memory.set_bytes(1, 0, &[0u8; 16]);
        let conn = Arc::new(DeviceConnection::new(
            Endpoint {
                host: "plc-a".into(),
                port: 102,
                rack: 0,
                slot: 1,
            },
            connector as Arc<dyn Connector>,
            &ConnectionConfig::default(),
        ));
        let client = Arc::new(ResilientClient::new(
            1,
            conn,
            RetryPolicy::no_retry(),
            CircuitBreakerConfig::default(),
        ));
        let rtdb = Arc::new(MemoryRtdb::new());
        let cache = Arc::new(TagCache::new(
            rtdb.clone() as Arc<dyn Rtdb>,
            &CacheConfig::default(),
        ));
        Fixture {
            plc,
            rtdb,
            cache,
            client,
        }
    }

    fn tag(id: i64, name: &str, dt: DataType, byte: i64) -> Tag {
        let mut t = Tag::new(1, name, dt, 1, byte, 0);
        t.id = id;
        t
    }

    fn poller(f: &Fixture, tags: Vec<Tag>) -> GroupPoller {
        GroupPoller::new(
            1,
            Duration::from_millis(1000),
            tags,
            f.client.clone(),
            f.cache.clone(),
            Arc::new(PollStats::default()),
        )
    }

    #[tokio::test]
    async fn test_unchanged_value_written_once() {
        let f = fixture();
        f.plc.memory.set_bytes(1, 2, &[0x01, 0x2C]);
        let mut p = poller(&f, vec![tag(5, "speed", DataType::Int16, 2)]);

        let first = p.poll_once().await;
        assert_eq!((first.read_ok, first.written, first.skipped), (1, 1, 0));
        let second = p.poll_once().await;
        assert_eq!((second.read_ok, second.written, second.skipped), (1, 0, 1));

        let cached = f.cache.get_tag_value(1, 5).await.unwrap().unwrap();
        assert_eq!(cached.tag_value().unwrap(), TagValue::Int16(300));
    }

    #[tokio::test]
    async fn test_unmonitored_tag_always_written() {
        let f = fixture();
        let mut t = tag(5, "speed", DataType::UInt8, 0);
        t.monitor_changes = false;
        let mut p = poller(&f, vec![t]);

        p.poll_once().await;
        p.poll_once().await;
        assert_eq!(f.rtdb.stats().writes, 2);
    }

    #[tokio::test]
    async fn test_seeded_from_existing_cache() {
        let f = fixture();
        f.plc.memory.set_bytes(1, 0, &[9]);
        f.cache
            .set_tag_value(1, 5, &TagValue::UInt8(9))
            .await
            .unwrap();
        let writes_before = f.rtdb.stats().writes;

        let mut p = poller(&f, vec![tag(5, "level", DataType::UInt8, 0)]);
        let report = p.poll_once().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(f.rtdb.stats().writes, writes_before);
    }

    #[tokio::test]
    async fn test_read_failure_counted_and_rest_polled() {
        let f = fixture();
        f.plc.fail_next_reads(1);
        let mut p = poller(
            &f,
            vec![
                tag(1, "a", DataType::UInt8, 0),
                tag(2, "b", DataType::UInt8, 1),
            ],
        );
        let report = p.poll_once().await;
        assert_eq!(report.read_failed, 1);
        assert_eq!(report.read_ok, 1);
        assert!(report.unavailable);
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let f = fixture();
        let stats = Arc::new(PollStats::default());
        let mut p = GroupPoller::new(
            1,
            Duration::from_millis(100),
            vec![tag(1, "a", DataType::UInt8, 0)],
            f.client.clone(),
            f.cache.clone(),
            stats.clone(),
        );
        p.poll_once().await;
        p.poll_once().await;
        let snap = stats.snapshot();
        assert_eq!(snap.ticks, 2);
        assert_eq!(snap.reads_ok, 2);
        assert_eq!(snap.cache_writes, 1);
        assert_eq!(snap.skipped_unchanged, 1);
        assert!(snap.last_poll_ms.is_some());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failure_and_recovery_logged_once() {
        let f = fixture();
        f.plc.fail_next_reads(2);
        let mut p = poller(&f, vec![tag(1, "a", DataType::UInt8, 0)]);

        p.poll_once().await;
        p.poll_once().await;
        p.poll_once().await;

        assert!(logs_contain("1 of 1 reads failed"));
        assert!(logs_contain("Reads recovered"));
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|l| l.contains("reads failed in")).count() {
                1 => Ok(()),
                n => Err(format!("expected one failure warning, saw {}", n)),
            }
        });
    }
}
