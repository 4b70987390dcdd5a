//! Breaker and retry behaviour seen from the poller
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod support;

use std::sync::Arc;
use std::time::Duration;

use plcsrv::device::{CircuitBreakerConfig, CircuitState, RetryPolicy};
use plcsrv::manager::{GroupPoller, PollStats};
use plcsrv::protocol::{Connector, MemoryConnector};
use plcsrv::{DataType, Tag, TagValue};

fn int_tag() -> Tag {
    let mut tag = Tag::new(7, "pressure", DataType::Int16, 1, 0, 0);
    tag.id = 70;
    tag.normalize_and_validate().unwrap();
    tag
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_then_recovers_after_cooldown() {
    support::init_tracing();
    let connector = Arc::new(MemoryConnector::new());
    let plc = connector.add_device("d7");
    plc.fail_next_reads(100);

    let client = support::client(
        7,
        support::endpoint("d7", 102),
        connector.clone() as Arc<dyn Connector>,
        RetryPolicy::no_retry(),
        CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        },
    );
    let (_, cache) = support::tag_cache();
    let mut poller = GroupPoller::new(
        7,
        Duration::from_secs(1),
        vec![int_tag()],
        client.clone(),
        cache.clone(),
        Arc::new(PollStats::default()),
    );

    for expected in 1..=3u64 {
        let report = poller.poll_once().await;
        assert_eq!(report.read_failed, 1);
        assert!(report.unavailable);
        // Every failure dropped the session, so each poll reconnects
        assert_eq!(plc.connect_count(), expected);
    }
    assert_eq!(client.breaker().state, CircuitState::Open);

    // Rejected without touching the device
    let report = poller.poll_once().await;
    assert!(report.unavailable);
    assert_eq!(plc.connect_count(), 3);
    assert!(client.breaker().rejected >= 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    plc.fail_next_reads(0);
    plc.script_reads(1, 0, [vec![0x00, 0x2A]]);

    let report = poller.poll_once().await;
    assert_eq!(report.read_ok, 1);
    assert_eq!(report.written, 1);
    assert_eq!(client.breaker().state, CircuitState::Closed);
    assert_eq!(plc.connect_count(), 4);

    let cached = cache.get_tag_value(7, 70).await.unwrap().unwrap();
    assert_eq!(cached.tag_value().unwrap(), TagValue::Int16(42));
}

#[tokio::test(start_paused = true)]
async fn test_retry_absorbs_single_transient_failure() {
    let connector = Arc::new(MemoryConnector::new());
    let plc = connector.add_device("d8");
    plc.fail_next_reads(1);
    plc.script_reads(1, 0, [vec![0x01, 0x00]]);

    let retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        backoff_factor: 2.0,
        jitter: false,
    };
    let client = support::client(
        8,
        support::endpoint("d8", 102),
        connector.clone() as Arc<dyn Connector>,
        retry,
        CircuitBreakerConfig::default(),
    );

    let value = client.read_tag(1, 0, 0, DataType::Int16).await.unwrap();
    assert_eq!(value, TagValue::Int16(256));
    assert_eq!(plc.connect_count(), 2);
    assert_eq!(client.breaker().state, CircuitState::Closed);
    assert_eq!(client.breaker().consecutive_failures, 0);
}
