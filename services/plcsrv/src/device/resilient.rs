//! Retry and circuit breaking around a device connection

use super::breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use super::connection::DeviceConnection;
use super::retry::RetryPolicy;
use crate::error::{PlcError, Result};
use crate::model::{DataType, TagValue};
use crate::protocol::codec::CodecError;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Device I/O with a retry budget per call and a shared circuit breaker
#[derive(Debug)]
pub struct ResilientClient {
    device_id: i64,
    conn: Arc<DeviceConnection>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ResilientClient {
    pub fn new(
        device_id: i64,
        conn: Arc<DeviceConnection>,
        retry: RetryPolicy,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            device_id,
            conn,
            retry,
            breaker: CircuitBreaker::new(breaker),
        }
    }

    pub fn device_id(&self) -> i64 {
        self.device_id
    }

    pub fn connection(&self) -> &Arc<DeviceConnection> {
        &self.conn
    }

    pub fn breaker(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    pub async fn connect(&self) -> Result<()> {
        self.execute("connect", || self.conn.connect()).await
    }

    pub async fn read_tag(
        &self,
        db: u16,
        byte_offset: u32,
        bit_offset: u8,
        data_type: DataType,
    ) -> Result<TagValue> {
        self.execute("read", || {
            self.conn.read_tag(db, byte_offset, bit_offset, data_type)
        })
        .await
    }

    pub async fn write_tag(
        &self,
        db: u16,
        byte_offset: u32,
        bit_offset: u8,
        data_type: DataType,
        value: &TagValue,
    ) -> Result<()> {
        // Type mismatches never reach the breaker
        if value.data_type() != data_type {
            return Err(CodecError::Conversion {
                from: value.data_type().as_str(),
                to: data_type.as_str(),
            }
            .into());
        }
        self.execute("write", || {
            self.conn
                .write_tag(db, byte_offset, bit_offset, data_type, value)
        })
        .await
    }

    /// Close the session and forget breaker history
    pub async fn reset(&self) {
        self.conn.close().await;
        self.breaker.reset();
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }

    /// Run `op` under the breaker, retrying transient failures with backoff
    ///
    /// Terminal failures carry the attempt count and the last cause.
    pub async fn execute<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if !self.breaker.try_acquire() {
                return Err(PlcError::CircuitOpen {
                    device_id: self.device_id,
                    attempts: attempt,
                    last_error: self.breaker.last_error(),
                });
            }
            attempt += 1;

            match op().await {
                Ok(value) => {
                    self.breaker.on_success();
                    return Ok(value);
                },
                Err(e) if e.is_transient() => {
                    self.breaker.on_failure(&e.to_string());
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            device_id = self.device_id,
                            attempt, "{} failed, giving up: {}", op_name, e
                        );
                        return Err(PlcError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        device_id = self.device_id,
                        attempt, "{} failed: {}, retrying in {:?}", op_name, e, delay
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => {
                    // The device answered, it just did not like the request
                    if matches!(e, PlcError::Protocol(_)) {
                        self.breaker.on_success();
                    } else {
                        self.breaker.release();
                    }
                    return Err(e);
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, RetryConfig};
    use crate::device::breaker::CircuitState;
    use crate::protocol::{Connector, Endpoint, MemoryConnector, SimulatedPlc};
    use std::time::Duration;

    fn client(
        max_retries: u32,
        failure_threshold: u32,
    ) -> (Arc<SimulatedPlc>, ResilientClient) {
        let connector = Arc::new(MemoryConnector::new());
        let plc = connector.add_device("plc-a");
        plc.memory.set_bytes(1, 0, &[0u8; 16]);
        let endpoint = Endpoint {
            host: "plc-a".to_string(),
            port: 102,
            rack: 0,
            slot: 1,
        };
        let conn = Arc::new(DeviceConnection::new(
            endpoint,
            connector as Arc<dyn Connector>,
            &ConnectionConfig::default(),
        ));
        let retry = RetryPolicy::from_config(&RetryConfig {
            max_retries,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_factor: 2.0,
        })
        .without_jitter();
        let breaker = CircuitBreakerConfig {
            failure_threshold,
            cooldown: Duration::from_secs(30),
        };
        (plc, ResilientClient::new(7, conn, retry, breaker))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried() {
        let (plc, client) = client(3, 10);
        plc.memory.set_bytes(1, 0, &[42]);
        plc.fail_next_reads(2);

        let started = tokio::time::Instant::now();
        let v = client.read_tag(1, 0, 0, DataType::UInt8).await.unwrap();
        assert_eq!(v, TagValue::UInt8(42));
        assert_eq!(plc.connect_count(), 3);
        // 100ms + 200ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_reports_attempts_and_cause() {
        let (plc, client) = client(3, 10);
        plc.fail_next_reads(10);

        let err = client.read_tag(1, 0, 0, DataType::UInt8).await.unwrap_err();
        match err {
            PlcError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("connection reset"));
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_not_retried() {
        let (plc, client) = client(3, 10);
        let err = client.read_tag(9, 0, 0, DataType::UInt8).await.unwrap_err();
        assert!(matches!(err, PlcError::Protocol(_)));
        assert_eq!(plc.connect_count(), 1);
        assert_eq!(client.breaker().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_mismatch_skips_breaker_and_io() {
        let (plc, client) = client(3, 1);
        let err = client
            .write_tag(1, 0, 0, DataType::Int16, &TagValue::Bool(true))
            .await
            .unwrap_err();
        assert!(matches!(err, PlcError::Codec(_)));
        assert_eq!(plc.connect_count(), 0);
        assert_eq!(client.breaker().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_then_recovers() {
        let (plc, client) = client(1, 3);
        plc.fail_next_reads(3);
        for _ in 0..3 {
            let err = client.read_tag(1, 0, 0, DataType::UInt8).await.unwrap_err();
            assert!(matches!(err, PlcError::RetriesExhausted { attempts: 1, .. }));
        }
        assert_eq!(plc.connect_count(), 3);

        // Rejected without touching the device
        let err = client.read_tag(1, 0, 0, DataType::UInt8).await.unwrap_err();
        match &err {
            PlcError::CircuitOpen {
                device_id,
                attempts,
                last_error,
            } => {
                assert_eq!(*device_id, 7);
                assert_eq!(*attempts, 0);
                assert!(last_error.as_deref().unwrap().contains("connection reset"));
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.to_string().starts_with("circuit breaker is open"));
        assert_eq!(plc.connect_count(), 3);

        tokio::time::advance(Duration::from_secs(30)).await;
        client.read_tag(1, 0, 0, DataType::UInt8).await.unwrap();
        assert_eq!(client.breaker().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_retry_stops_loop() {
        let (plc, client) = client(5, 2);
        plc.fail_next_reads(10);
        let err = client.read_tag(1, 0, 0, DataType::UInt8).await.unwrap_err();
        assert!(matches!(err, PlcError::CircuitOpen { attempts: 2, .. }));
        assert_eq!(plc.connect_count(), 2);
    }
}
