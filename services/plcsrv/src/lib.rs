//! PLC Gateway Service (plcsrv)
//!
//! Keeps live sessions to S7-compatible PLCs, polls configured tags into a
//! TTL cache, writes values back on request, and keeps a fast-access mirror
//! of the device/tag configuration consistent with the durable SQLite store.
//!
//! ```text
//! DeviceTagService ──► DeviceManager ──► GroupPoller ──► ResilientClient ──► DeviceConnection ──► Transport
//!        │                   │                │
//!        ▼                   ▼                ▼
//!   SyncService        StatusRecorder      TagCache
//!   (SQLite ⇄ RTDB)
//! ```

pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod model;
pub mod protocol;
pub mod service;
pub mod store;
pub mod sync;

pub use cache::{CachedValue, TagCache};
pub use config::AppConfig;
pub use error::{PlcError, Result};
pub use manager::DeviceManager;
pub use model::{DataType, Device, DeviceStatus, Tag, TagValue};
pub use service::{DeviceTagService, HealthReport, HealthStatus};
pub use store::{ConfigStore, RtdbConfigStore, SqliteStore};
pub use sync::SyncService;
