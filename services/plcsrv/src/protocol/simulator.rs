//! PLC simulators for testing
//!
//! - [`S7Simulator`]: a small ISO-on-TCP server backed by [`PlcMemory`],
//!   speaking the same framing as [`S7Transport`](super::transport::S7Transport).
//! - [`MemoryConnector`]: an in-process [`Connector`] with scripted reads and
//!   fault injection, for exercising the connection and polling layers
//!   without sockets.

use super::frame::{self, DEFAULT_PDU_SIZE, FN_READ_VAR, FN_SETUP_COMM, FN_WRITE_VAR};
use super::transport::{Connector, Endpoint, Transport};
use crate::error::{PlcError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// ============================================================================
// DB memory
// ============================================================================

/// Data block memory shared between a simulator and the test driving it
#[derive(Debug, Clone, Default)]
pub struct PlcMemory {
    blocks: Arc<Mutex<HashMap<u16, Vec<u8>>>>,
}

impl PlcMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or resize) a zero-filled data block
    pub fn with_db(self, db: u16, size: usize) -> Self {
        self.blocks.lock().entry(db).or_default().resize(size, 0);
        self
    }

    pub fn set_bytes(&self, db: u16, start: usize, bytes: &[u8]) {
        let mut blocks = self.blocks.lock();
        let block = blocks.entry(db).or_default();
        if block.len() < start + bytes.len() {
            block.resize(start + bytes.len(), 0);
        }
        block[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn bytes(&self, db: u16, start: usize, len: usize) -> Option<Vec<u8>> {
        self.blocks
            .lock()
            .get(&db)
            .and_then(|b| b.get(start..start + len))
            .map(<[u8]>::to_vec)
    }

    /// Read as the device would, answering with an S7 return code on failure
    pub fn read(&self, db: u16, start: usize, len: usize) -> std::result::Result<Vec<u8>, u8> {
        let blocks = self.blocks.lock();
        let block = blocks.get(&db).ok_or(frame::RC_OBJECT_MISSING)?;
        block
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or(frame::RC_ADDRESS_OUT_OF_RANGE)
    }

    pub fn write(&self, db: u16, start: usize, data: &[u8]) -> std::result::Result<(), u8> {
        let mut blocks = self.blocks.lock();
        let block = blocks.get_mut(&db).ok_or(frame::RC_OBJECT_MISSING)?;
        block
            .get_mut(start..start + data.len())
            .ok_or(frame::RC_ADDRESS_OUT_OF_RANGE)?
            .copy_from_slice(data);
        Ok(())
    }
}

// ============================================================================
// S7 TCP simulator
// ============================================================================

/// Simple S7 server for integration testing
pub struct S7Simulator {
    memory: PlcMemory,
    pdu_size: u16,
    connections: Arc<AtomicUsize>,
}

/// Handle to a running simulator; dropping it does not stop the server
pub struct SimulatorHandle {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl SimulatorHandle {
    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl S7Simulator {
    pub fn new(memory: PlcMemory) -> Self {
        Self {
            memory,
            pdu_size: DEFAULT_PDU_SIZE,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cap the PDU size offered during negotiation
    pub fn with_pdu_size(mut self, pdu_size: u16) -> Self {
        self.pdu_size = pdu_size;
        self
    }

    /// Start simulator server on `127.0.0.1:port` (0 for an ephemeral port)
    pub async fn start(self, port: u16) -> Result<SimulatorHandle> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        info!("S7 simulator listening on {}", addr);

        let cancel = CancellationToken::new();
        let handle = SimulatorHandle {
            addr,
            connections: Arc::clone(&self.connections),
            cancel: cancel.clone(),
        };
        let sim = Arc::new(self);

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Simulator connection from {}", peer);
                        sim.connections.fetch_add(1, Ordering::Relaxed);
                        let sim = Arc::clone(&sim);
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {},
                                res = sim.handle_connection(stream) => {
                                    if let Err(e) = res {
                                        debug!("Simulator connection closed: {}", e);
                                    }
                                },
                            }
                        });
                    },
                    Err(e) => {
                        debug!("Simulator accept error: {}", e);
                        break;
                    },
                }
            }
        });

        Ok(handle)
    }

    async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut header = [0u8; frame::TPKT_HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let total = frame::tpkt_length(&header)?;
        let mut buf = vec![0u8; total];
        buf[..frame::TPKT_HEADER_LEN].copy_from_slice(&header);
        stream.read_exact(&mut buf[frame::TPKT_HEADER_LEN..]).await?;
        Ok(buf)
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let request = Self::read_frame(&mut stream).await?;
        let (rack, slot) = frame::parse_connection_request(&request)?;
        debug!("Simulator COTP connect rack {} slot {}", rack, slot);
        stream.write_all(&frame::connection_confirm()).await?;

        loop {
            let request = Self::read_frame(&mut stream).await?;
            let reply = self.handle_request(&request)?;
            stream.write_all(&reply).await?;
        }
    }

    fn handle_request(&self, request: &[u8]) -> Result<bytes::Bytes> {
        let pdu = frame::parse_pdu(request)?;
        match pdu.function() {
            Some(FN_SETUP_COMM) => {
                let requested = frame::setup_pdu_size(&pdu)?;
                Ok(frame::setup_communication_response(
                    pdu.pdu_ref,
                    requested.min(self.pdu_size),
                ))
            },
            Some(FN_READ_VAR) => {
                let addr = frame::parse_item(pdu.params)?;
                let result = self.memory.read(
                    addr.db,
                    addr.start as usize,
                    usize::from(addr.len),
                );
                Ok(frame::read_response(
                    pdu.pdu_ref,
                    result.as_deref().map_err(|code| *code),
                ))
            },
            Some(FN_WRITE_VAR) => {
                let addr = frame::parse_item(pdu.params)?;
                let payload = frame::write_payload(&pdu)?;
                let code = match self.memory.write(addr.db, addr.start as usize, payload) {
                    Ok(()) => frame::RC_SUCCESS,
                    Err(code) => code,
                };
                Ok(frame::write_response(pdu.pdu_ref, code))
            },
            other => Err(PlcError::protocol(format!(
                "simulator does not support function {:?}",
                other
            ))),
        }
    }
}

// ============================================================================
// In-process connector
// ============================================================================

/// One simulated device behind a [`MemoryConnector`]
#[derive(Debug, Default)]
pub struct SimulatedPlc {
    pub memory: PlcMemory,
    scripted: Mutex<HashMap<(u16, u32), VecDeque<Vec<u8>>>>,
    refuse_connect: AtomicBool,
    unreachable: AtomicBool,
    failing_reads: AtomicU32,
    io_delay_ms: AtomicU64,
    connects: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl SimulatedPlc {
    /// Queue byte spans returned by successive reads at `(db, start)`
    ///
    /// Once the queue drains, reads fall back to memory.
    pub fn script_reads(&self, db: u16, start: u32, responses: impl IntoIterator<Item = Vec<u8>>) {
        self.scripted
            .lock()
            .entry((db, start))
            .or_default()
            .extend(responses);
    }

    /// Reject session handshakes while set
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::Relaxed);
    }

    /// Fail pings and connects as if the host were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    /// Make the next `n` reads fail with a connection reset
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::Relaxed);
    }

    /// Delay every read/write, for timeout tests
    pub fn set_io_delay(&self, delay: Duration) {
        self.io_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    async fn io_delay(&self) {
        let ms = self.io_delay_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// Connector resolving endpoints by host name to simulated devices
#[derive(Debug, Default)]
pub struct MemoryConnector {
    devices: Mutex<HashMap<String, Arc<SimulatedPlc>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device reachable at `host`
    pub fn add_device(&self, host: &str) -> Arc<SimulatedPlc> {
        Arc::clone(
            self.devices
                .lock()
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(SimulatedPlc::default())),
        )
    }

    pub fn device(&self, host: &str) -> Option<Arc<SimulatedPlc>> {
        self.devices.lock().get(host).cloned()
    }

    fn lookup(&self, endpoint: &Endpoint) -> Result<Arc<SimulatedPlc>> {
        let plc = self
            .device(&endpoint.host)
            .ok_or_else(|| PlcError::connection(format!("connection refused: {}", endpoint)))?;
        if plc.unreachable.load(Ordering::Relaxed) {
            return Err(PlcError::Timeout(format!("no route to {}", endpoint)));
        }
        Ok(plc)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
        let plc = self.lookup(endpoint)?;
        if plc.refuse_connect.load(Ordering::Relaxed) {
            return Err(PlcError::connection(format!(
                "connection rejected by device {}",
                endpoint
            )));
        }
        plc.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransport { plc }))
    }

    async fn ping(&self, endpoint: &Endpoint) -> Result<()> {
        self.lookup(endpoint).map(|_| ())
    }
}

struct MemoryTransport {
    plc: Arc<SimulatedPlc>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read_area(&mut self, db: u16, start: u32, len: usize) -> Result<Vec<u8>> {
        self.plc.io_delay().await;
        let failing = self
            .plc
            .failing_reads
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PlcError::connection("connection reset by peer"));
        }
        self.plc.reads.fetch_add(1, Ordering::Relaxed);

        let scripted = self
            .plc
            .scripted
            .lock()
            .get_mut(&(db, start))
            .and_then(VecDeque::pop_front);
        if let Some(mut bytes) = scripted {
            bytes.resize(len, 0);
            return Ok(bytes);
        }

        self.plc
            .memory
            .read(db, start as usize, len)
            .map_err(|code| {
                PlcError::protocol(format!(
                    "read failed: {} ({:#04x})",
                    frame::return_code_message(code),
                    code
                ))
            })
    }

    async fn write_area(&mut self, db: u16, start: u32, data: &[u8]) -> Result<()> {
        self.plc.io_delay().await;
        self.plc.writes.fetch_add(1, Ordering::Relaxed);
        self.plc
            .memory
            .write(db, start as usize, data)
            .map_err(|code| {
                PlcError::protocol(format!(
                    "write failed: {} ({:#04x})",
                    frame::return_code_message(code),
                    code
                ))
            })
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn endpoint(host: &str) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port: 102,
            rack: 0,
            slot: 1,
        }
    }

    #[test]
    fn test_memory_read_write_codes() {
        let memory = PlcMemory::new().with_db(1, 16);
        memory.write(1, 2, &[0xAB, 0xCD]).unwrap();
        assert_eq!(memory.read(1, 2, 2).unwrap(), vec![0xAB, 0xCD]);
        assert_eq!(memory.read(2, 0, 1), Err(frame::RC_OBJECT_MISSING));
        assert_eq!(memory.read(1, 15, 4), Err(frame::RC_ADDRESS_OUT_OF_RANGE));
    }

    #[tokio::test]
    async fn test_scripted_reads_then_memory() {
        let connector = MemoryConnector::new();
        let plc = connector.add_device("plc-a");
        plc.memory.set_bytes(1, 0, &[0x55]);
        plc.script_reads(1, 0, vec![vec![0x01], vec![0x02]]);

        let mut transport = connector.connect(&endpoint("plc-a")).await.unwrap();
        assert_eq!(transport.read_area(1, 0, 1).await.unwrap(), vec![0x01]);
        assert_eq!(transport.read_area(1, 0, 1).await.unwrap(), vec![0x02]);
        assert_eq!(transport.read_area(1, 0, 1).await.unwrap(), vec![0x55]);
        assert_eq!(plc.read_count(), 3);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let connector = MemoryConnector::new();
        let plc = connector.add_device("plc-b");
        plc.memory.set_bytes(1, 0, &[0x00]);

        assert!(connector.connect(&endpoint("missing")).await.is_err());

        plc.set_refuse_connect(true);
        assert!(connector.connect(&endpoint("plc-b")).await.is_err());
        connector.ping(&endpoint("plc-b")).await.unwrap();
        plc.set_refuse_connect(false);

        let mut transport = connector.connect(&endpoint("plc-b")).await.unwrap();
        plc.fail_next_reads(1);
        assert!(transport.read_area(1, 0, 1).await.unwrap_err().is_transient());
        assert!(transport.read_area(1, 0, 1).await.is_ok());

        plc.set_unreachable(true);
        assert!(connector.ping(&endpoint("plc-b")).await.is_err());
    }
}
