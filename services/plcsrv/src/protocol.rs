//! Device wire protocol: value codec, S7 framing, transports and simulators

pub mod codec;
pub mod frame;
pub mod simulator;
pub mod transport;

pub use codec::CodecError;
pub use simulator::{MemoryConnector, PlcMemory, S7Simulator, SimulatedPlc};
pub use transport::{Connector, Endpoint, S7Connector, Transport};
