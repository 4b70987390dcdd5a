//! Fast-access configuration mirror in the RTDB
//!
//! Key layout (`{p}` is the configured key prefix):
//!
//! | Key                        | Type | Content                  |
//! |----------------------------|------|--------------------------|
//! | `{p}cfg:device:{id}`       | KV   | device JSON              |
//! | `{p}cfg:devices`           | SET  | device ids               |
//! | `{p}cfg:device:{id}:tags`  | SET  | tag ids of that device   |
//! | `{p}cfg:tag:{id}`          | KV   | tag JSON                 |
//! | `{p}cfg:tags`              | SET  | tag ids                  |
//! | `{p}cfg:tags:name:{name}`  | SET  | tag ids with that name   |
//!
//! Entities are mirrored verbatim, timestamps included, and never expire.

use super::{ConfigStore, StoreError, StoreResult};
use crate::model::{Device, DeviceStatus, Tag};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use gateway_rtdb::Rtdb;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

pub struct RtdbConfigStore {
    rtdb: Arc<dyn Rtdb>,
    prefix: String,
}

impl std::fmt::Debug for RtdbConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtdbConfigStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RtdbConfigStore {
    pub fn new(rtdb: Arc<dyn Rtdb>, prefix: impl Into<String>) -> Self {
        Self {
            rtdb,
            prefix: prefix.into(),
        }
    }

    fn device_key(&self, id: i64) -> String {
        format!("{}cfg:device:{}", self.prefix, id)
    }

    fn devices_key(&self) -> String {
        format!("{}cfg:devices", self.prefix)
    }

    fn device_tags_key(&self, device_id: i64) -> String {
        format!("{}cfg:device:{}:tags", self.prefix, device_id)
    }

    fn tag_key(&self, id: i64) -> String {
        format!("{}cfg:tag:{}", self.prefix, id)
    }

    fn tags_key(&self) -> String {
        format!("{}cfg:tags", self.prefix)
    }

    fn tag_name_key(&self, name: &str) -> String {
        format!("{}cfg:tags:name:{}", self.prefix, name)
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.rtdb.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save<T: serde::Serialize>(&self, key: &str, entity: &T) -> StoreResult<()> {
        let raw = serde_json::to_vec(entity)?;
        self.rtdb.set(key, Bytes::from(raw)).await?;
        Ok(())
    }

    /// Load every id in an index set, skipping members whose blob is gone
    async fn load_indexed<T: DeserializeOwned>(
        &self,
        index_key: &str,
        entity_key: impl Fn(i64) -> String,
    ) -> StoreResult<Vec<T>> {
        let mut ids: Vec<i64> = self
            .rtdb
            .smembers(index_key)
            .await?
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        ids.sort_unstable();

        let loads = ids.iter().map(|id| {
            let key = entity_key(*id);
            async move { (key.clone(), self.load::<T>(&key).await) }
        });
        let mut out = Vec::with_capacity(ids.len());
        for (key, result) in join_all(loads).await {
            match result? {
                Some(entity) => out.push(entity),
                None => debug!("Index {} references missing {}", index_key, key),
            }
        }
        Ok(out)
    }

    async fn index_tag(&self, tag: &Tag) -> StoreResult<()> {
        let id = tag.id.to_string();
        self.rtdb.sadd(&self.tags_key(), &id).await?;
        self.rtdb
            .sadd(&self.device_tags_key(tag.device_id), &id)
            .await?;
        self.rtdb.sadd(&self.tag_name_key(&tag.name), &id).await?;
        Ok(())
    }

    async fn unindex_tag(&self, tag: &Tag) -> StoreResult<()> {
        let id = tag.id.to_string();
        self.rtdb.srem(&self.tags_key(), &id).await?;
        self.rtdb
            .srem(&self.device_tags_key(tag.device_id), &id)
            .await?;
        self.rtdb.srem(&self.tag_name_key(&tag.name), &id).await?;
        Ok(())
    }
}

fn require_id(kind: &str, id: i64) -> StoreResult<()> {
    if id <= 0 {
        return Err(StoreError::invalid(format!(
            "{} mirror requires an assigned id, got {}",
            kind, id
        )));
    }
    Ok(())
}

#[async_trait]
impl ConfigStore for RtdbConfigStore {
    fn name(&self) -> &'static str {
        "rtdb"
    }

    async fn get_device(&self, id: i64) -> StoreResult<Device> {
        self.load(&self.device_key(id))
            .await?
            .ok_or_else(|| StoreError::not_found(format!("device {}", id)))
    }

    async fn list_devices(&self) -> StoreResult<Vec<Device>> {
        self.load_indexed(&self.devices_key(), |id| self.device_key(id))
            .await
    }

    async fn create_device(&self, device: &Device) -> StoreResult<Device> {
        require_id("device", device.id)?;
        let key = self.device_key(device.id);
        if self.rtdb.get(&key).await?.is_some() {
            return Err(StoreError::invalid(format!(
                "device {} already exists",
                device.id
            )));
        }
        self.save(&key, device).await?;
        self.rtdb
            .sadd(&self.devices_key(), &device.id.to_string())
            .await?;
        Ok(device.clone())
    }

    async fn update_device(&self, device: &Device) -> StoreResult<Device> {
        let key = self.device_key(device.id);
        if self.rtdb.get(&key).await?.is_none() {
            return Err(StoreError::not_found(format!("device {}", device.id)));
        }
        self.save(&key, device).await?;
        Ok(device.clone())
    }

    async fn delete_device(&self, id: i64) -> StoreResult<()> {
        let existed = self.rtdb.del(&self.device_key(id)).await?;
        self.rtdb
            .srem(&self.devices_key(), &id.to_string())
            .await?;
        self.rtdb.del(&self.device_tags_key(id)).await?;
        if !existed {
            return Err(StoreError::not_found(format!("device {}", id)));
        }
        Ok(())
    }

    async fn set_device_status(&self, id: i64, status: DeviceStatus) -> StoreResult<()> {
        let mut device = self.get_device(id).await?;
        device.status = status;
        self.save(&self.device_key(id), &device).await
    }

    async fn get_tag(&self, id: i64) -> StoreResult<Tag> {
        self.load(&self.tag_key(id))
            .await?
            .ok_or_else(|| StoreError::not_found(format!("tag {}", id)))
    }

    async fn list_tags(&self) -> StoreResult<Vec<Tag>> {
        self.load_indexed(&self.tags_key(), |id| self.tag_key(id))
            .await
    }

    async fn list_tags_for_device(&self, device_id: i64) -> StoreResult<Vec<Tag>> {
        self.load_indexed(&self.device_tags_key(device_id), |id| self.tag_key(id))
            .await
    }

    async fn find_tags_by_name(&self, name: &str) -> StoreResult<Vec<Tag>> {
        let tags: Vec<Tag> = self
            .load_indexed(&self.tag_name_key(name), |id| self.tag_key(id))
            .await?;
        // The name index can lag a rename
        Ok(tags.into_iter().filter(|t| t.name == name).collect())
    }

    async fn create_tag(&self, tag: &Tag) -> StoreResult<Tag> {
        require_id("tag", tag.id)?;
        let key = self.tag_key(tag.id);
        if self.rtdb.get(&key).await?.is_some() {
            return Err(StoreError::invalid(format!("tag {} already exists", tag.id)));
        }
        self.save(&key, tag).await?;
        self.index_tag(tag).await?;
        Ok(tag.clone())
    }

    async fn update_tag(&self, tag: &Tag) -> StoreResult<Tag> {
        let key = self.tag_key(tag.id);
        let previous: Tag = self
            .load(&key)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("tag {}", tag.id)))?;
        self.save(&key, tag).await?;
        if previous.device_id != tag.device_id || previous.name != tag.name {
            self.unindex_tag(&previous).await?;
        }
        self.index_tag(tag).await?;
        Ok(tag.clone())
    }

    async fn delete_tag(&self, id: i64) -> StoreResult<()> {
        let tag = self.get_tag(id).await?;
        self.rtdb.del(&self.tag_key(id)).await?;
        self.unindex_tag(&tag).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.rtdb.ping().await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::model::DataType;
    use crate::store::StoreErrorKind;
    use gateway_rtdb::MemoryRtdb;

    fn store() -> (Arc<MemoryRtdb>, RtdbConfigStore) {
        let rtdb = Arc::new(MemoryRtdb::new());
        let store = RtdbConfigStore::new(rtdb.clone() as Arc<dyn Rtdb>, "gw1:");
        (rtdb, store)
    }

    fn device(id: i64, name: &str) -> Device {
        let mut d = Device::new(name, "10.0.0.5", 0, 1);
        d.id = id;
        d
    }

    fn tag(id: i64, device_id: i64, name: &str) -> Tag {
        let mut t = Tag::new(device_id, name, DataType::Int16, 1, 0, 0);
        t.id = id;
        t
    }

    #[tokio::test]
    async fn test_device_mirror_roundtrip() {
        let (rtdb, store) = store();
        store.create_device(&device(2, "b")).await.unwrap();
        store.create_device(&device(1, "a")).await.unwrap();
        assert!(rtdb.get("gw1:cfg:device:1").await.unwrap().is_some());

        let all = store.list_devices().await.unwrap();
        assert_eq!(all.iter().map(|d| d.id).collect::<Vec<_>>(), vec![1, 2]);

        store
            .set_device_status(1, DeviceStatus::Online)
            .await
            .unwrap();
        assert_eq!(
            store.get_device(1).await.unwrap().status,
            DeviceStatus::Online
        );

        let err = store.create_device(&device(1, "a")).await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Invalid);

        store.delete_device(1).await.unwrap();
        assert!(store.get_device(1).await.unwrap_err().is_not_found());
        assert!(store.delete_device(1).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (_, store) = store();
        let err = store.update_device(&device(5, "x")).await.unwrap_err();
        assert!(err.is_not_found());
        let err = store.update_tag(&tag(5, 1, "x")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unassigned_id_rejected() {
        let (_, store) = store();
        let err = store.create_device(&device(0, "x")).await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_tag_indexes_follow_updates() {
        let (_, store) = store();
        store.create_tag(&tag(10, 1, "speed")).await.unwrap();
        store.create_tag(&tag(11, 2, "speed")).await.unwrap();

        assert_eq!(store.find_tags_by_name("speed").await.unwrap().len(), 2);
        assert_eq!(store.list_tags_for_device(1).await.unwrap().len(), 1);

        let mut moved = tag(10, 2, "rpm");
        moved.scan_rate_ms = 500;
        store.update_tag(&moved).await.unwrap();

        assert_eq!(store.find_tags_by_name("speed").await.unwrap().len(), 1);
        assert_eq!(store.find_tags_by_name("rpm").await.unwrap()[0].scan_rate_ms, 500);
        assert!(store.list_tags_for_device(1).await.unwrap().is_empty());
        assert_eq!(store.list_tags_for_device(2).await.unwrap().len(), 2);

        store.delete_tag(10).await.unwrap();
        assert!(store.find_tags_by_name("rpm").await.unwrap().is_empty());
        assert_eq!(store.list_tags().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_transient() {
        let (rtdb, store) = store();
        rtdb.set_fail_reads(true);
        let err = store.get_device(1).await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Transient);
    }
}
