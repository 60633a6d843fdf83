//! Fire-and-forget command dispatch
//!
//! A command is appended to the device's command log and never read back:
//! the device drains the log, executes, and updates the status on its own.

use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};

use crate::store::{SharedStoreRef, StorePath, server_timestamp, validate_segment};
use crate::{Error, Result};

/// Top-level store node holding per-device command logs
pub const COMMANDS_ROOT: &str = "commands";

/// Per-device subtrees wiped by [`CommandDispatcher::clear`]
const DEVICE_QUEUES: [&str; 4] = [COMMANDS_ROOT, "requests", "responses", "results"];

/// Store-assigned identifier of a dispatched command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    /// Borrow the raw key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Appends commands to device command logs
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    store: SharedStoreRef,
}

impl CommandDispatcher {
    /// Create a dispatcher writing to `store`
    #[must_use]
    pub fn new(store: SharedStoreRef) -> Self {
        Self { store }
    }

    /// Queue `verb` (with optional `payload`) for `device_id`
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for an empty device ID or verb and
    /// `Error::StoreUnavailable` if the append fails
    pub async fn dispatch(
        &self,
        device_id: &str,
        verb: &str,
        payload: Option<Value>,
    ) -> Result<CommandId> {
        validate_segment(device_id)?;
        let verb = verb.trim();
        if verb.is_empty() {
            return Err(Error::Validation("command verb must not be empty".to_string()));
        }

        let mut record = json!({
            "command": verb,
            "timestamp": server_timestamp(),
            "status": "pending",
        });
        if let Some(payload) = payload.filter(|p| !p.is_null()) {
            record["extra"] = payload;
        }

        let log = StorePath::new(COMMANDS_ROOT)?.child(device_id)?;
        let key = self.store.push(&log, record).await?;

        tracing::info!(device_id = %device_id, command = %verb, key = %key, "command queued");
        Ok(CommandId(key))
    }

    /// Drop everything queued for or answered by `device_id`
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for an invalid device ID and
    /// `Error::StoreUnavailable` if any removal fails
    pub async fn clear(&self, device_id: &str) -> Result<()> {
        validate_segment(device_id)?;

        let paths = DEVICE_QUEUES
            .iter()
            .map(|root| StorePath::new(root)?.child(device_id))
            .collect::<Result<Vec<_>>>()?;

        futures::future::try_join_all(paths.iter().map(|path| self.store.remove(path))).await?;

        tracing::info!(device_id = %device_id, "device queues cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::{MemoryStore, SharedStore};

    fn setup() -> (MemoryStore, CommandDispatcher) {
        let store = MemoryStore::new();
        let dispatcher = CommandDispatcher::new(Arc::new(store.clone()));
        (store, dispatcher)
    }

    #[tokio::test]
    async fn dispatch_appends_pending_command() {
        let (store, dispatcher) = setup();

        let id = dispatcher.dispatch("dev1", "flashlight on", None).await.unwrap();
        assert!(!id.as_str().is_empty());

        let log = store.dump();
        let record = &log["commands"]["dev1"][id.as_str()];
        assert_eq!(record["command"], "flashlight on");
        assert_eq!(record["status"], "pending");
        assert!(record["timestamp"].is_i64());
        assert!(record.get("extra").is_none());
    }

    #[tokio::test]
    async fn repeated_dispatch_is_independent() {
        let (store, dispatcher) = setup();

        let first = dispatcher.dispatch("dev1", "flashlight on", None).await.unwrap();
        let second = dispatcher.dispatch("dev1", "flashlight on", None).await.unwrap();

        assert_ne!(first, second);
        let log = store.dump();
        assert_eq!(log["commands"]["dev1"].as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn payload_is_stored_as_extra() {
        let (store, dispatcher) = setup();
        let id = dispatcher
            .dispatch("dev1", "showToast", Some(json!("locked by admin")))
            .await
            .unwrap();
        assert_eq!(store.dump()["commands"]["dev1"][id.as_str()]["extra"], "locked by admin");
    }

    #[tokio::test]
    async fn invalid_input_never_touches_store() {
        let (store, dispatcher) = setup();

        assert!(matches!(
            dispatcher.dispatch("", "flashlight on", None).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            dispatcher.dispatch("dev1", "  ", None).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            dispatcher.dispatch("dev/1", "x", None).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(store.dump(), Value::Null);
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_unavailable() {
        let (store, dispatcher) = setup();
        store.set_offline(true);
        assert!(matches!(
            dispatcher.dispatch("dev1", "flashlight on", None).await,
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn clear_removes_device_queues_only() {
        let (store, dispatcher) = setup();
        dispatcher.dispatch("dev1", "a", None).await.unwrap();
        dispatcher.dispatch("dev2", "b", None).await.unwrap();
        store
            .set(&StorePath::parse("responses/dev1/sms").unwrap(), json!({"requestId": "1"}))
            .await
            .unwrap();

        dispatcher.clear("dev1").await.unwrap();

        let dump = store.dump();
        assert!(dump["commands"].get("dev1").is_none());
        assert!(dump.get("responses").is_none());
        assert!(dump["commands"].get("dev2").is_some());
    }
}
