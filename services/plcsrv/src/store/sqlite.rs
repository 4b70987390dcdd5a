//! Durable configuration store on SQLite

use super::{ConfigStore, StoreError, StoreResult};
use crate::model::{DataType, Device, DeviceStatus, Tag};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::sqlite::SqliteClient;
use sqlx::{sqlite::SqliteRow, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// DDL owned by the service bootstrap; applied with `CREATE ... IF NOT EXISTS`
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        address TEXT NOT NULL,
        rack INTEGER NOT NULL DEFAULT 0,
        slot INTEGER NOT NULL DEFAULT 0,
        active BOOLEAN NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS device_status (
        device_id INTEGER PRIMARY KEY REFERENCES devices(id) ON DELETE CASCADE,
        status TEXT NOT NULL,
        last_update TIMESTAMP NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        db_number INTEGER NOT NULL,
        byte_offset INTEGER NOT NULL,
        bit_offset INTEGER NOT NULL DEFAULT 0,
        data_type TEXT NOT NULL,
        scan_rate INTEGER NOT NULL DEFAULT 1000,
        monitor_changes BOOLEAN NOT NULL DEFAULT 1,
        can_write BOOLEAN NOT NULL DEFAULT 0,
        active BOOLEAN NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL,
        UNIQUE(device_id, name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tags_device ON tags(device_id)",
    "CREATE INDEX IF NOT EXISTS idx_tags_name ON tags(name)",
];

const DEVICE_COLUMNS: &str = r#"
    d.id, d.name, d.address, d.rack, d.slot, d.active, d.created_at, d.updated_at,
    COALESCE(s.status, 'unknown') AS status
    FROM devices d
    LEFT JOIN device_status s ON s.device_id = d.id
"#;

const TAG_COLUMNS: &str = r#"
    id, device_id, name, description, db_number, byte_offset, bit_offset, data_type,
    scan_rate, monitor_changes, can_write, active, created_at, updated_at
    FROM tags
"#;

/// Authoritative device/tag store
///
/// Stamps `created_at`/`updated_at` itself; timestamps on the way in are
/// ignored.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    client: Arc<SqliteClient>,
}

impl SqliteStore {
    pub fn new(client: Arc<SqliteClient>) -> Self {
        Self { client }
    }

    /// Open the client and make sure the schema exists
    pub async fn bootstrap(client: Arc<SqliteClient>) -> StoreResult<Self> {
        client.apply_schema(SCHEMA).await?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Arc<SqliteClient> {
        &self.client
    }

    async fn fetch_devices(&self, filter: &str) -> StoreResult<Vec<Device>> {
        let sql = format!("SELECT {} {} ORDER BY d.id ASC", DEVICE_COLUMNS, filter);
        let rows = sqlx::query(&sql).fetch_all(self.client.pool()).await?;
        rows.iter().map(hydrate_device).collect()
    }

    async fn fetch_tags(&self, sql: &str, bind: Option<SqlArg<'_>>) -> StoreResult<Vec<Tag>> {
        let query = sqlx::query(sql);
        let query = match bind {
            Some(SqlArg::Int(v)) => query.bind(v),
            Some(SqlArg::Text(v)) => query.bind(v),
            None => query,
        };
        let rows = query.fetch_all(self.client.pool()).await?;
        rows.iter().map(hydrate_tag).collect()
    }
}

enum SqlArg<'a> {
    Int(i64),
    Text(&'a str),
}

fn hydrate_device(row: &SqliteRow) -> StoreResult<Device> {
    Ok(Device {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        rack: row.try_get("rack")?,
        slot: row.try_get("slot")?,
        active: row.try_get("active")?,
        status: DeviceStatus::parse_lossy(row.try_get::<&str, _>("status")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn hydrate_tag(row: &SqliteRow) -> StoreResult<Tag> {
    let data_type: &str = row.try_get("data_type")?;
    let data_type = DataType::from_str(data_type)
        .map_err(|e| StoreError::invalid(format!("tag data_type: {}", e)))?;
    Ok(Tag {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        db_number: row.try_get("db_number")?,
        byte_offset: row.try_get("byte_offset")?,
        bit_offset: row.try_get("bit_offset")?,
        data_type,
        scan_rate_ms: row.try_get("scan_rate")?,
        monitor_changes: row.try_get("monitor_changes")?,
        can_write: row.try_get("can_write")?,
        active: row.try_get("active")?,
        last_value: None,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn explicit_id(id: i64) -> Option<i64> {
    (id > 0).then_some(id)
}

#[async_trait]
impl ConfigStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get_device(&self, id: i64) -> StoreResult<Device> {
        let sql = format!("SELECT {} WHERE d.id = ?", DEVICE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.client.pool())
            .await?
            .ok_or_else(|| StoreError::not_found(format!("device {}", id)))?;
        hydrate_device(&row)
    }

    async fn list_devices(&self) -> StoreResult<Vec<Device>> {
        self.fetch_devices("").await
    }

    async fn list_active_devices(&self) -> StoreResult<Vec<Device>> {
        self.fetch_devices("WHERE d.active = 1").await
    }

    async fn create_device(&self, device: &Device) -> StoreResult<Device> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO devices (id, name, address, rack, slot, active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(explicit_id(device.id))
        .bind(&device.name)
        .bind(&device.address)
        .bind(device.rack)
        .bind(device.slot)
        .bind(device.active)
        .bind(now)
        .bind(now)
        .execute(self.client.pool())
        .await?;

        let id = result.last_insert_rowid();
        debug!("Created device {} ({})", id, device.name);
        self.get_device(id).await
    }

    async fn update_device(&self, device: &Device) -> StoreResult<Device> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET name = ?, address = ?, rack = ?, slot = ?, active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&device.name)
        .bind(&device.address)
        .bind(device.rack)
        .bind(device.slot)
        .bind(device.active)
        .bind(Utc::now())
        .bind(device.id)
        .execute(self.client.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("device {}", device.id)));
        }
        self.get_device(device.id).await
    }

    async fn delete_device(&self, id: i64) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(id)
            .execute(self.client.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("device {}", id)));
        }
        Ok(())
    }

    async fn set_device_status(&self, id: i64, status: DeviceStatus) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO device_status (device_id, status, last_update)
            VALUES (?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                status = excluded.status,
                last_update = excluded.last_update
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(self.client.pool())
        .await
        .map_err(|e| match StoreError::from(e) {
            // FK violation: the device row is gone
            err if err.kind == super::StoreErrorKind::Invalid => {
                StoreError::not_found(format!("device {}", id))
            },
            err => err,
        })?;
        Ok(())
    }

    async fn get_tag(&self, id: i64) -> StoreResult<Tag> {
        let sql = format!("SELECT {} WHERE id = ?", TAG_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.client.pool())
            .await?
            .ok_or_else(|| StoreError::not_found(format!("tag {}", id)))?;
        hydrate_tag(&row)
    }

    async fn list_tags(&self) -> StoreResult<Vec<Tag>> {
        let sql = format!("SELECT {} ORDER BY id ASC", TAG_COLUMNS);
        self.fetch_tags(&sql, None).await
    }

    async fn list_tags_for_device(&self, device_id: i64) -> StoreResult<Vec<Tag>> {
        let sql = format!("SELECT {} WHERE device_id = ? ORDER BY id ASC", TAG_COLUMNS);
        self.fetch_tags(&sql, Some(SqlArg::Int(device_id))).await
    }

    async fn find_tags_by_name(&self, name: &str) -> StoreResult<Vec<Tag>> {
        let sql = format!("SELECT {} WHERE name = ? ORDER BY id ASC", TAG_COLUMNS);
        self.fetch_tags(&sql, Some(SqlArg::Text(name))).await
    }

    async fn create_tag(&self, tag: &Tag) -> StoreResult<Tag> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO tags (id, device_id, name, description, db_number, byte_offset,
                              bit_offset, data_type, scan_rate, monitor_changes, can_write,
                              active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(explicit_id(tag.id))
        .bind(tag.device_id)
        .bind(&tag.name)
        .bind(&tag.description)
        .bind(tag.db_number)
        .bind(tag.byte_offset)
        .bind(tag.bit_offset)
        .bind(tag.data_type.as_str())
        .bind(tag.scan_rate_ms)
        .bind(tag.monitor_changes)
        .bind(tag.can_write)
        .bind(tag.active)
        .bind(now)
        .bind(now)
        .execute(self.client.pool())
        .await?;

        let id = result.last_insert_rowid();
        debug!("Created tag {} ({}) on device {}", id, tag.name, tag.device_id);
        self.get_tag(id).await
    }

    async fn update_tag(&self, tag: &Tag) -> StoreResult<Tag> {
        let result = sqlx::query(
            r#"
            UPDATE tags
            SET device_id = ?, name = ?, description = ?, db_number = ?, byte_offset = ?,
                bit_offset = ?, data_type = ?, scan_rate = ?, monitor_changes = ?,
                can_write = ?, active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(tag.device_id)
        .bind(&tag.name)
        .bind(&tag.description)
        .bind(tag.db_number)
        .bind(tag.byte_offset)
        .bind(tag.bit_offset)
        .bind(tag.data_type.as_str())
        .bind(tag.scan_rate_ms)
        .bind(tag.monitor_changes)
        .bind(tag.can_write)
        .bind(tag.active)
        .bind(Utc::now())
        .bind(tag.id)
        .execute(self.client.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("tag {}", tag.id)));
        }
        self.get_tag(tag.id).await
    }

    async fn delete_tag(&self, id: i64) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM tags WHERE id = ?")
            .bind(id)
            .execute(self.client.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("tag {}", id)));
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.client.ping().await?;
        Ok(())
    }

    async fn devices_modified_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM devices WHERE updated_at > ? ORDER BY id ASC")
            .bind(since)
            .fetch_all(self.client.pool())
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(StoreError::from))
            .collect()
    }

    async fn tags_modified_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM tags WHERE updated_at > ? ORDER BY id ASC")
            .bind(since)
            .fetch_all(self.client.pool())
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(StoreError::from))
            .collect()
    }
}
