//! Device presence registry
//!
//! Devices register once and then heartbeat. A device counts as online
//! while its last heartbeat is younger than the presence window.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::Result;
use crate::store::{SharedStoreRef, StorePath, now_ms, server_timestamp, validate_segment};

/// Store node holding presence records
pub const PRESENCE_ROOT: &str = "onlineDevices";

/// Default presence window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(120);

/// Stored presence record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    #[serde(default)]
    pub info: Value,
    #[serde(default)]
    pub last_seen: i64,
    #[serde(default)]
    pub online: bool,
}

/// A device seen inside the presence window
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineDevice {
    pub device_id: String,
    pub info: Value,
    pub last_seen: i64,
}

/// Tracks which devices are online
#[derive(Debug, Clone)]
pub struct PresenceRegistry {
    store: SharedStoreRef,
    window: Duration,
}

impl PresenceRegistry {
    /// Create a registry with the given presence window
    #[must_use]
    pub fn new(store: SharedStoreRef, window: Duration) -> Self {
        Self { store, window }
    }

    /// Presence window
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Register (or re-register) a device, replacing its record
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a bad device ID and
    /// `Error::StoreUnavailable` if the write fails
    pub async fn register(&self, device_id: &str, info: Option<Value>) -> Result<()> {
        let path = Self::record_path(device_id)?;
        let record = json!({
            "info": info.filter(|i| !i.is_null()).unwrap_or_else(|| json!({})),
            "lastSeen": server_timestamp(),
            "online": true,
        });
        self.store.set(&path, record).await?;

        tracing::info!(device_id = %device_id, "device registered");
        Ok(())
    }

    /// Refresh a device's last-seen time, replacing its info if given
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a bad device ID and
    /// `Error::StoreUnavailable` if the write fails
    pub async fn heartbeat(&self, device_id: &str, info: Option<Value>) -> Result<()> {
        let path = Self::record_path(device_id)?;
        let mut fields = Map::new();
        fields.insert("lastSeen".to_string(), server_timestamp());
        fields.insert("online".to_string(), Value::Bool(true));
        if let Some(info) = info.filter(|i| !i.is_null()) {
            fields.insert("info".to_string(), info);
        }
        self.store.update(&path, fields).await?;

        tracing::trace!(device_id = %device_id, "heartbeat");
        Ok(())
    }

    /// Devices seen inside the presence window, sorted by ID
    ///
    /// Devices that fell out of the window are flagged offline in the store.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreUnavailable` if the registry cannot be read
    pub async fn list_online(&self) -> Result<Vec<OnlineDevice>> {
        let root = StorePath::new(PRESENCE_ROOT)?;
        let Some(Value::Object(records)) = self.store.get(&root).await? else {
            return Ok(Vec::new());
        };

        let now = now_ms();
        let window = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        let mut online = Vec::new();

        for (device_id, raw) in records {
            let record: PresenceRecord = match serde_json::from_value(raw) {
                Ok(record) => record,
                Err(e) => {
                    tracing::debug!(device_id = %device_id, error = %e, "skipping malformed presence record");
                    continue;
                }
            };

            if now.saturating_sub(record.last_seen) < window {
                online.push(OnlineDevice {
                    device_id,
                    info: record.info,
                    last_seen: record.last_seen,
                });
            } else if record.online {
                self.mark_offline(&device_id).await;
            }
        }

        online.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(online)
    }

    /// Drop a device from the registry
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a bad device ID and
    /// `Error::StoreUnavailable` if the delete fails
    pub async fn remove(&self, device_id: &str) -> Result<()> {
        let path = Self::record_path(device_id)?;
        self.store.remove(&path).await?;
        tracing::info!(device_id = %device_id, "device removed");
        Ok(())
    }

    /// Whether the device has ever registered
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a bad device ID and
    /// `Error::StoreUnavailable` if the registry cannot be read
    pub async fn exists(&self, device_id: &str) -> Result<bool> {
        let path = Self::record_path(device_id)?;
        Ok(self.store.get(&path).await?.is_some())
    }

    async fn mark_offline(&self, device_id: &str) {
        let Ok(path) = Self::record_path(device_id) else {
            return;
        };
        let mut fields = Map::new();
        fields.insert("online".to_string(), Value::Bool(false));
        match self.store.update(&path, fields).await {
            Ok(()) => tracing::debug!(device_id = %device_id, "device went offline"),
            Err(e) => tracing::warn!(device_id = %device_id, error = %e, "failed to flag device offline"),
        }
    }

    fn record_path(device_id: &str) -> Result<StorePath> {
        validate_segment(device_id)?;
        StorePath::new(PRESENCE_ROOT)?.child(device_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::Error;
    use crate::store::{MemoryStore, SharedStore};

    fn setup() -> (MemoryStore, PresenceRegistry) {
        let store = MemoryStore::new();
        let registry = PresenceRegistry::new(Arc::new(store.clone()), DEFAULT_WINDOW);
        (store, registry)
    }

    #[tokio::test]
    async fn registered_device_is_online() {
        let (_store, registry) = setup();
        registry
            .register("dev1", Some(json!({"model": "Pixel 7"})))
            .await
            .unwrap();

        let online = registry.list_online().await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].device_id, "dev1");
        assert_eq!(online[0].info["model"], "Pixel 7");
        assert!(registry.exists("dev1").await.unwrap());
        assert!(!registry.exists("dev2").await.unwrap());
    }

    #[tokio::test]
    async fn stale_device_is_hidden_and_flagged_offline() {
        let (store, registry) = setup();
        let stale_at = now_ms() - 5 * 60 * 1000;
        store
            .set(
                &StorePath::parse("onlineDevices/old").unwrap(),
                json!({"info": {}, "lastSeen": stale_at, "online": true}),
            )
            .await
            .unwrap();
        registry.register("fresh", None).await.unwrap();

        let online = registry.list_online().await.unwrap();
        assert_eq!(online.iter().map(|d| d.device_id.as_str()).collect::<Vec<_>>(), ["fresh"]);

        let old = &store.dump()["onlineDevices"]["old"];
        assert_eq!(old["online"], false);
        assert_eq!(old["lastSeen"], stale_at);
    }

    #[tokio::test]
    async fn heartbeat_keeps_info_unless_replaced() {
        let (store, registry) = setup();
        registry.register("dev1", Some(json!({"model": "A"}))).await.unwrap();

        registry.heartbeat("dev1", None).await.unwrap();
        assert_eq!(store.dump()["onlineDevices"]["dev1"]["info"]["model"], "A");

        registry.heartbeat("dev1", Some(json!({"model": "B"}))).await.unwrap();
        assert_eq!(store.dump()["onlineDevices"]["dev1"]["info"]["model"], "B");
    }

    #[tokio::test]
    async fn heartbeat_revives_offline_device() {
        let (store, registry) = setup();
        store
            .set(
                &StorePath::parse("onlineDevices/dev1").unwrap(),
                json!({"info": {}, "lastSeen": 0, "online": false}),
            )
            .await
            .unwrap();
        assert!(registry.list_online().await.unwrap().is_empty());

        registry.heartbeat("dev1", None).await.unwrap();
        assert_eq!(registry.list_online().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_and_validation() {
        let (store, registry) = setup();
        registry.register("dev1", None).await.unwrap();
        registry.remove("dev1").await.unwrap();
        assert_eq!(store.dump(), json!({}));

        assert!(matches!(registry.register("", None).await, Err(Error::Validation(_))));
        assert!(matches!(registry.heartbeat("a.b", None).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let (store, registry) = setup();
        store
            .set(&StorePath::parse("onlineDevices/weird").unwrap(), json!("not an object"))
            .await
            .unwrap();
        registry.register("dev1", None).await.unwrap();
        assert_eq!(registry.list_online().await.unwrap().len(), 1);
    }
}
