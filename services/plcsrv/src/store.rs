//! Configuration repositories
//!
//! Devices and tags live in two stores: the durable SQLite database, which is
//! authoritative, and a fast-access mirror in the RTDB. Both implement
//! [`ConfigStore`] and report failures through one [`StoreErrorKind`], so
//! callers branch on kind rather than on backend-specific sentinels.

pub mod rtdb;
pub mod sqlite;

pub use rtdb::RtdbConfigStore;
pub use sqlite::SqliteStore;

use crate::model::{Device, DeviceStatus, Tag};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    NotFound,
    /// Backend unreachable or failed mid-operation
    Transient,
    /// Rejected by the store: constraint violation or undecodable entity
    Invalid,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "not found",
            Self::Transient => "transient",
            Self::Invalid => "invalid",
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} ({kind})")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Invalid,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == StoreErrorKind::NotFound
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::not_found(err.to_string()),
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                Self::invalid(db.message().to_string())
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::invalid(err.to_string())
            },
            _ => Self::transient(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Device and tag repository
///
/// `create_*` keeps a positive `id` when given one and assigns one otherwise;
/// `update_*` and `delete_*` report `NotFound` for unknown ids. Lists are
/// ordered by ascending id.
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    /// Short backend name for logs and health reports
    fn name(&self) -> &'static str;

    async fn get_device(&self, id: i64) -> StoreResult<Device>;

    async fn list_devices(&self) -> StoreResult<Vec<Device>>;

    async fn list_active_devices(&self) -> StoreResult<Vec<Device>> {
        let mut devices = self.list_devices().await?;
        devices.retain(|d| d.active);
        Ok(devices)
    }

    async fn create_device(&self, device: &Device) -> StoreResult<Device>;

    async fn update_device(&self, device: &Device) -> StoreResult<Device>;

    async fn delete_device(&self, id: i64) -> StoreResult<()>;

    async fn set_device_status(&self, id: i64, status: DeviceStatus) -> StoreResult<()>;

    async fn get_tag(&self, id: i64) -> StoreResult<Tag>;

    async fn list_tags(&self) -> StoreResult<Vec<Tag>>;

    async fn list_tags_for_device(&self, device_id: i64) -> StoreResult<Vec<Tag>>;

    async fn find_tags_by_name(&self, name: &str) -> StoreResult<Vec<Tag>>;

    async fn create_tag(&self, tag: &Tag) -> StoreResult<Tag>;

    async fn update_tag(&self, tag: &Tag) -> StoreResult<Tag>;

    async fn delete_tag(&self, id: i64) -> StoreResult<()>;

    async fn ping(&self) -> StoreResult<()>;

    /// Ids of devices whose `updated_at` is after `since`
    async fn devices_modified_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .filter(|d| d.updated_at > since)
            .map(|d| d.id)
            .collect())
    }

    /// Ids of tags whose `updated_at` is after `since`
    async fn tags_modified_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        Ok(self
            .list_tags()
            .await?
            .into_iter()
            .filter(|t| t.updated_at > since)
            .map(|t| t.id)
            .collect())
    }
}
