//! One device session with lazy (re)connect

use crate::config::ConnectionConfig;
use crate::error::{PlcError, Result};
use crate::model::{DataType, TagValue};
use crate::protocol::codec;
use crate::protocol::{Connector, Endpoint, Transport};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

type Session = Option<Box<dyn Transport>>;

enum Request<'a> {
    Read { db: u16, start: u32, len: usize },
    Write { db: u16, start: u32, data: &'a [u8] },
}

/// A device session guarded by a single lock
///
/// Every protocol exchange holds the session lock for its whole duration, so
/// reads and writes issued by different pollers never interleave on the wire.
pub struct DeviceConnection {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    io_timeout: Duration,
    session: Mutex<Session>,
    state: AtomicU8,
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DeviceConnection {
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>, config: &ConnectionConfig) -> Self {
        Self {
            endpoint,
            connector,
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
            session: Mutex::new(None),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Open the session; a no-op when already connected
    ///
    /// Never retries.
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.open(&mut session).await
    }

    /// Reconnect synchronously if the session was lost
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect().await
    }

    async fn open(&self, session: &mut Session) -> Result<()> {
        if session.is_some() {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);
        let result = match timeout(self.connect_timeout, self.connector.connect(&self.endpoint)).await
        {
            Ok(result) => result,
            Err(_) => Err(PlcError::Timeout(format!(
                "connect to {} timed out after {:?}",
                self.endpoint, self.connect_timeout
            ))),
        };
        match result {
            Ok(transport) => {
                *session = Some(transport);
                self.set_state(ConnectionState::Connected);
                info!("Connected to {}", self.endpoint);
                Ok(())
            },
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                debug!("Connect to {} failed: {}", self.endpoint, e);
                Err(e)
            },
        }
    }

    /// Bare reachability check, independent of the session
    pub async fn ping(&self) -> Result<()> {
        match timeout(self.connect_timeout, self.connector.ping(&self.endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(PlcError::Timeout(format!(
                "ping {} timed out after {:?}",
                self.endpoint, self.connect_timeout
            ))),
        }
    }

    /// Read and decode one tag
    pub async fn read_tag(
        &self,
        db: u16,
        byte_offset: u32,
        bit_offset: u8,
        data_type: DataType,
    ) -> Result<TagValue> {
        let mut session = self.session.lock().await;
        if data_type == DataType::String {
            return self.read_string(&mut session, db, byte_offset).await;
        }
        let bytes = self
            .exchange(
                &mut session,
                Request::Read {
                    db,
                    start: byte_offset,
                    len: data_type.wire_size(),
                },
            )
            .await?;
        Ok(codec::decode(&bytes, 0, bit_offset, data_type)?)
    }

    /// Counted string: the `[max, len]` header first, then only `len` bytes
    async fn read_string(&self, session: &mut Session, db: u16, byte_offset: u32) -> Result<TagValue> {
        let mut bytes = self
            .exchange(
                session,
                Request::Read {
                    db,
                    start: byte_offset,
                    len: 2,
                },
            )
            .await?;
        let declared = bytes
            .get(1)
            .copied()
            .ok_or_else(|| PlcError::protocol("short string header"))?;
        let actual = usize::from(declared).min(codec::STRING_MAX_LEN);
        if actual > 0 {
            let payload = self
                .exchange(
                    session,
                    Request::Read {
                        db,
                        start: byte_offset + 2,
                        len: actual,
                    },
                )
                .await?;
            bytes.extend_from_slice(&payload);
        }
        Ok(codec::decode(&bytes, 0, 0, DataType::String)?)
    }

    /// Encode and write one tag
    ///
    /// Bools read the current byte and write it back with only the target bit
    /// changed; both exchanges happen under one lock hold.
    pub async fn write_tag(
        &self,
        db: u16,
        byte_offset: u32,
        bit_offset: u8,
        data_type: DataType,
        value: &TagValue,
    ) -> Result<()> {
        if value.data_type() != data_type {
            return Err(codec::CodecError::Conversion {
                from: value.data_type().as_str(),
                to: data_type.as_str(),
            }
            .into());
        }

        let mut session = self.session.lock().await;
        let payload = if data_type == DataType::Bool {
            let mut current = self
                .exchange(
                    &mut session,
                    Request::Read {
                        db,
                        start: byte_offset,
                        len: 1,
                    },
                )
                .await?;
            codec::encode(&mut current, 0, bit_offset, data_type, value)?;
            current
        } else {
            codec::encode_field(data_type, value)?
        };
        self.exchange(
            &mut session,
            Request::Write {
                db,
                start: byte_offset,
                data: &payload,
            },
        )
        .await
        .map(|_| ())
    }

    /// One bounded request/response, connecting first if needed
    ///
    /// Transient failures drop the session so the next call reconnects.
    async fn exchange(&self, session: &mut Session, request: Request<'_>) -> Result<Vec<u8>> {
        self.open(session).await?;
        let Some(transport) = session.as_mut() else {
            return Err(PlcError::connection(format!("no session to {}", self.endpoint)));
        };
        let io = async {
            match request {
                Request::Read { db, start, len } => transport.read_area(db, start, len).await,
                Request::Write { db, start, data } => {
                    transport.write_area(db, start, data).await.map(|_| Vec::new())
                },
            }
        };
        let result = match timeout(self.io_timeout, io).await {
            Ok(result) => result,
            Err(_) => Err(PlcError::Timeout(format!(
                "I/O with {} timed out after {:?}",
                self.endpoint, self.io_timeout
            ))),
        };
        if let Err(e) = &result {
            if e.is_transient() {
                self.drop_session(session, e).await;
            }
        }
        result
    }

    async fn drop_session(&self, session: &mut Session, error: &PlcError) {
        if let Some(mut transport) = session.take() {
            warn!("Dropping session to {}: {}", self.endpoint, error);
            transport.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Close the session; safe to call repeatedly
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        if let Some(mut transport) = session.take() {
            transport.close().await;
            info!("Disconnected from {}", self.endpoint);
        }
        self.set_state(ConnectionState::Disconnected);
    }
}
