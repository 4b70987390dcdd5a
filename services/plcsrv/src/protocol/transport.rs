//! Raw device transports
//!
//! A [`Transport`] moves byte spans in and out of DB memory; a [`Connector`]
//! opens transports and answers bare liveness checks. The production pair is
//! [`S7Connector`]/[`S7Transport`] over ISO-on-TCP.

use super::frame::{self, DbAddress, DEFAULT_PDU_SIZE, TPKT_HEADER_LEN};
use crate::error::{PlcError, Result};
use crate::model::Device;
use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Where and how to reach one device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
}

impl Endpoint {
    /// Resolve a device's `host[:port]` address, defaulting the port
    pub fn from_device(device: &Device, default_port: u16) -> Result<Self> {
        let address = device.address.trim();
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port.parse::<u16>().map_err(|_| {
                    PlcError::Validation(format!("invalid port in address '{}'", address))
                })?;
                (host.to_string(), port)
            },
            _ => (address.to_string(), default_port),
        };
        if host.is_empty() {
            return Err(PlcError::Validation("device address is required".into()));
        }
        Ok(Self {
            host,
            port,
            rack: u8::try_from(device.rack)
                .map_err(|_| PlcError::Validation(format!("invalid rack {}", device.rack)))?,
            slot: u8::try_from(device.slot)
                .map_err(|_| PlcError::Validation(format!("invalid slot {}", device.slot)))?,
        })
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (rack {}, slot {})",
            self.host, self.port, self.rack, self.slot
        )
    }
}

/// One established session
///
/// Implementations perform a single request/response exchange per call;
/// callers serialise access.
#[async_trait]
pub trait Transport: Send {
    async fn read_area(&mut self, db: u16, start: u32, len: usize) -> Result<Vec<u8>>;

    async fn write_area(&mut self, db: u16, start: u32, data: &[u8]) -> Result<()>;

    async fn close(&mut self);
}

/// Factory for transports
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a session including the protocol handshake
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>>;

    /// Low-level reachability check, independent of any session
    async fn ping(&self, endpoint: &Endpoint) -> Result<()>;
}

// ============================================================================
// S7 over ISO-on-TCP
// ============================================================================

/// Opens S7 sessions over TCP
#[derive(Debug, Clone)]
pub struct S7Connector {
    pdu_size: u16,
}

impl S7Connector {
    pub fn new() -> Self {
        Self {
            pdu_size: DEFAULT_PDU_SIZE,
        }
    }

    /// Request a specific PDU size during negotiation
    pub fn with_pdu_size(pdu_size: u16) -> Self {
        Self { pdu_size }
    }
}

impl Default for S7Connector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for S7Connector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
        let stream = TcpStream::connect(endpoint.socket_addr()).await?;
        stream.set_nodelay(true)?;
        let transport = S7Transport::handshake(stream, endpoint, self.pdu_size).await?;
        Ok(Box::new(transport))
    }

    async fn ping(&self, endpoint: &Endpoint) -> Result<()> {
        let stream = TcpStream::connect(endpoint.socket_addr()).await?;
        drop(stream);
        Ok(())
    }
}

/// An established S7 session
pub struct S7Transport {
    stream: TcpStream,
    pdu_size: u16,
    next_ref: u16,
}

impl S7Transport {
    /// COTP connect, then S7 setup-communication
    pub async fn handshake(mut stream: TcpStream, endpoint: &Endpoint, pdu_size: u16) -> Result<Self> {
        stream
            .write_all(&frame::connection_request(endpoint.rack, endpoint.slot))
            .await?;
        let reply = read_frame(&mut stream).await?;
        frame::parse_connection_confirm(&reply)?;

        let mut transport = Self {
            stream,
            pdu_size,
            next_ref: 0,
        };
        let pdu_ref = transport.next_pdu_ref();
        transport
            .stream
            .write_all(&frame::setup_communication(pdu_ref, pdu_size))
            .await?;
        let reply = read_frame(&mut transport.stream).await?;
        transport.pdu_size = frame::parse_setup_response(&reply, pdu_ref)?;

        debug!("S7 session to {} negotiated PDU {}", endpoint, transport.pdu_size);
        Ok(transport)
    }

    pub fn pdu_size(&self) -> u16 {
        self.pdu_size
    }

    fn next_pdu_ref(&mut self) -> u16 {
        self.next_ref = self.next_ref.wrapping_add(1).max(1);
        self.next_ref
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut header = [0u8; TPKT_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let total = frame::tpkt_length(&header)?;
    let mut buf = vec![0u8; total];
    buf[..TPKT_HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut buf[TPKT_HEADER_LEN..]).await?;
    Ok(buf)
}

impl S7Transport {
    async fn read_chunk(&mut self, db: u16, start: u32, len: usize) -> Result<Vec<u8>> {
        let pdu_ref = self.next_pdu_ref();
        let addr = DbAddress {
            db,
            start,
            len: len as u16,
        };
        self.stream
            .write_all(&frame::read_request(pdu_ref, &addr))
            .await?;
        let reply = read_frame(&mut self.stream).await?;
        let data = frame::parse_read_response(&reply, pdu_ref)?;
        if data.len() != len {
            return Err(PlcError::protocol(format!(
                "requested {} bytes from DB{}.{}, received {}",
                len,
                db,
                start,
                data.len()
            )));
        }
        Ok(data)
    }

    async fn write_chunk(&mut self, db: u16, start: u32, data: &[u8]) -> Result<()> {
        let pdu_ref = self.next_pdu_ref();
        self.stream
            .write_all(&frame::write_request(pdu_ref, db, start, data))
            .await?;
        let reply = read_frame(&mut self.stream).await?;
        frame::parse_write_response(&reply, pdu_ref)
    }
}

fn chunk_limit(max: usize, pdu_size: u16) -> Result<usize> {
    if max == 0 {
        return Err(PlcError::protocol(format!(
            "negotiated PDU {} leaves no room for data",
            pdu_size
        )));
    }
    Ok(max)
}

/// Spans larger than one PDU are split into consecutive requests
#[async_trait]
impl Transport for S7Transport {
    async fn read_area(&mut self, db: u16, start: u32, len: usize) -> Result<Vec<u8>> {
        let max = chunk_limit(frame::max_read_payload(self.pdu_size), self.pdu_size)?;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let take = (len - out.len()).min(max);
            let offset = start + out.len() as u32;
            let chunk = self.read_chunk(db, offset, take).await?;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    async fn write_area(&mut self, db: u16, start: u32, data: &[u8]) -> Result<()> {
        let max = chunk_limit(frame::max_write_payload(self.pdu_size), self.pdu_size)?;
        let mut offset = start;
        for chunk in data.chunks(max) {
            self.write_chunk(db, offset, chunk).await?;
            offset += chunk.len() as u32;
        }
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocol::frame::ISO_TCP_PORT;

    #[test]
    fn test_endpoint_from_device() {
        let device = Device::new("plc1", "10.0.0.5", 0, 2);
        let ep = Endpoint::from_device(&device, ISO_TCP_PORT).unwrap();
        assert_eq!(ep.socket_addr(), "10.0.0.5:102");
        assert_eq!((ep.rack, ep.slot), (0, 2));

        let device = Device::new("plc1", "127.0.0.1:10102", 0, 1);
        let ep = Endpoint::from_device(&device, ISO_TCP_PORT).unwrap();
        assert_eq!(ep.port, 10102);

        let device = Device::new("plc1", "host:notaport", 0, 1);
        assert!(Endpoint::from_device(&device, ISO_TCP_PORT).is_err());
    }

    #[tokio::test]
    async fn test_ping_refused_is_connection_error() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let ep = Endpoint {
            host: "127.0.0.1".to_string(),
            port,
            rack: 0,
            slot: 1,
        };
        let err = S7Connector::new().ping(&ep).await.unwrap_err();
        assert!(err.is_transient());
    }
}
