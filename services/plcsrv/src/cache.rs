//! Live tag value cache
//!
//! One key per tag, `{prefix}plc:{device_id}:tag:{tag_id}`, holding a JSON
//! envelope `{"value": .., "type": .., "timestamp_ms": ..}`. Entries expire
//! after the configured TTL; every read refreshes it.

use crate::config::CacheConfig;
use crate::error::{PlcError, Result};
use crate::model::{DataType, TagValue};
use bytes::Bytes;
use chrono::Utc;
use gateway_rtdb::Rtdb;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// TTL for the health-check key
const HEALTH_KEY_TTL: Duration = Duration::from_secs(10);

/// Cached tag value envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    pub value: serde_json::Value,
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

impl CachedValue {
    pub fn new(value: &TagValue) -> Self {
        Self {
            value: value.to_json(),
            data_type: value.data_type(),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Typed view of the stored value
    pub fn tag_value(&self) -> Result<TagValue> {
        Ok(TagValue::convert(&self.value, self.data_type)?)
    }
}

/// Tag key of a cache entry
pub type TagKey = (i64, i64);

pub struct TagCache {
    rtdb: Arc<dyn Rtdb>,
    prefix: String,
    ttl: Duration,
}

impl std::fmt::Debug for TagCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagCache")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TagCache {
    pub fn new(rtdb: Arc<dyn Rtdb>, config: &CacheConfig) -> Self {
        Self {
            rtdb,
            prefix: config.key_prefix.clone(),
            ttl: config.ttl(),
        }
    }

    pub fn key(&self, device_id: i64, tag_id: i64) -> String {
        format!("{}plc:{}:tag:{}", self.prefix, device_id, tag_id)
    }

    pub async fn set_tag_value(&self, device_id: i64, tag_id: i64, value: &TagValue) -> Result<()> {
        let raw = serde_json::to_vec(&CachedValue::new(value)).map_err(PlcError::cache)?;
        self.rtdb
            .set_ex(&self.key(device_id, tag_id), Bytes::from(raw), self.ttl)
            .await
            .map_err(PlcError::cache)
    }

    /// Latest value, or `None` when absent or expired
    pub async fn get_tag_value(&self, device_id: i64, tag_id: i64) -> Result<Option<CachedValue>> {
        let key = self.key(device_id, tag_id);
        let raw = self
            .rtdb
            .get_ex(&key, self.ttl)
            .await
            .map_err(PlcError::cache)?;
        match raw {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| PlcError::Cache(format!("corrupt entry {}: {}", key, e))),
            None => Ok(None),
        }
    }

    /// Fetch many entries in one round trip
    ///
    /// Absent keys are left out of the result; undecodable ones are logged
    /// and skipped.
    pub async fn batch_get(&self, keys: &[TagKey]) -> Result<HashMap<TagKey, CachedValue>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let raw_keys: Vec<String> = keys.iter().map(|(d, t)| self.key(*d, *t)).collect();
        let values = self
            .rtdb
            .mget_ex(&raw_keys, self.ttl)
            .await
            .map_err(PlcError::cache)?;

        let mut out = HashMap::with_capacity(keys.len());
        for ((key, raw_key), raw) in keys.iter().zip(&raw_keys).zip(values) {
            let Some(raw) = raw else { continue };
            match serde_json::from_slice::<CachedValue>(&raw) {
                Ok(v) => {
                    out.insert(*key, v);
                },
                Err(e) => warn!("Skipping corrupt cache entry {}: {}", raw_key, e),
            }
        }
        Ok(out)
    }

    /// Store many values in one round trip
    pub async fn batch_set(&self, values: &[(TagKey, TagValue)]) -> Result<()> {
        let mut entries = Vec::with_capacity(values.len());
        for ((device_id, tag_id), value) in values {
            match serde_json::to_vec(&CachedValue::new(value)) {
                Ok(raw) => entries.push((self.key(*device_id, *tag_id), Bytes::from(raw))),
                Err(e) => warn!(
                    "Skipping unserialisable value for device {} tag {}: {}",
                    device_id, tag_id, e
                ),
            }
        }
        if entries.is_empty() {
            return Ok(());
        }
        self.rtdb
            .mset_ex(entries, self.ttl)
            .await
            .map_err(PlcError::cache)
    }

    pub async fn delete_tag_value(&self, device_id: i64, tag_id: i64) -> Result<bool> {
        self.rtdb
            .del(&self.key(device_id, tag_id))
            .await
            .map_err(PlcError::cache)
    }

    /// Write, read back and delete a scratch key
    pub async fn health_check(&self) -> Result<()> {
        let nonce = format!("{}-{}", Utc::now().timestamp_millis(), rand::random::<u32>());
        let key = format!("{}plc:health:{}", self.prefix, nonce);
        self.rtdb
            .set_ex(&key, Bytes::from(nonce.clone()), HEALTH_KEY_TTL)
            .await
            .map_err(PlcError::cache)?;
        let read = self.rtdb.get(&key).await.map_err(PlcError::cache);
        let _ = self.rtdb.del(&key).await;
        match read? {
            Some(v) if v.as_ref() == nonce.as_bytes() => {
                debug!("Cache health check passed");
                Ok(())
            },
            Some(_) => Err(PlcError::Cache("health check read back a different value".into())),
            None => Err(PlcError::Cache("health check key missing after write".into())),
        }
    }
}
