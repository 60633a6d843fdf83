//! Broker - the gateway service object
//!
//! Owns the store handle and every component built on it: the command
//! dispatcher, the request correlator, the live frame relay and the
//! presence registry. Built once at startup, shared by the HTTP layer, and
//! shut down explicitly.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::config::{Config, StoreConfig};
use crate::correlator::{Correlator, Reply, RequestKind};
use crate::dispatch::{CommandDispatcher, CommandId};
use crate::presence::PresenceRegistry;
use crate::relay::{CameraFacing, FrameRelay, ViewerStream};
use crate::store::{FirebaseStore, MemoryStore, SharedStoreRef};
use crate::{Error, Result};

/// Gateway service object
#[derive(Debug, Clone)]
pub struct Broker {
    store: SharedStoreRef,
    dispatcher: CommandDispatcher,
    correlator: Arc<Correlator>,
    relay: FrameRelay,
    presence: PresenceRegistry,
    require_known_device: bool,
}

impl Broker {
    /// Build a broker over the store the configuration selects
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the store backend cannot be created
    pub fn from_config(config: &Config) -> Result<Self> {
        let store: SharedStoreRef = match &config.store {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::Firebase(firebase) => Arc::new(FirebaseStore::new(firebase.clone())?),
        };
        tracing::info!(backend = store.backend(), "shared store ready");
        Ok(Self::new(store, config))
    }

    /// Build a broker over an existing store
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(store: SharedStoreRef, config: &Config) -> Self {
        let dispatcher = CommandDispatcher::new(Arc::clone(&store));
        let correlator = config
            .timeouts
            .iter()
            .fold(Correlator::new(Arc::clone(&store)), |c, (kind, timeout)| {
                c.with_timeout(*kind, *timeout)
            });
        let correlator = Arc::new(correlator);
        let relay = FrameRelay::new(
            dispatcher.clone(),
            Arc::clone(&store),
            Arc::clone(&correlator),
            config.relay,
        );
        let presence = PresenceRegistry::new(Arc::clone(&store), config.presence_window);

        Self {
            store,
            dispatcher,
            correlator,
            relay,
            presence,
            require_known_device: config.require_known_device,
        }
    }

    /// Store handle
    #[must_use]
    pub fn store(&self) -> &SharedStoreRef {
        &self.store
    }

    /// Presence registry
    #[must_use]
    pub const fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Live frame relay
    #[must_use]
    pub const fn relay(&self) -> &FrameRelay {
        &self.relay
    }

    /// Request correlator
    #[must_use]
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Queue a command for a device
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's errors, or `Error::NotFound` for an unknown
    /// device when only registered devices are accepted
    pub async fn dispatch(
        &self,
        device_id: &str,
        verb: &str,
        payload: Option<Value>,
    ) -> Result<CommandId> {
        self.ensure_known(device_id).await?;
        self.dispatcher.dispatch(device_id, verb, payload).await
    }

    /// Wipe everything queued for or answered by a device
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's errors
    pub async fn clear(&self, device_id: &str) -> Result<()> {
        self.dispatcher.clear(device_id).await
    }

    /// Ask a device for data and wait for the answer
    ///
    /// # Errors
    ///
    /// Returns the correlator's errors, or `Error::NotFound` for an unknown
    /// device when only registered devices are accepted
    pub async fn request(
        &self,
        device_id: &str,
        kind: RequestKind,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        self.ensure_known(device_id).await?;
        self.correlator
            .await_response(device_id, kind, params, timeout)
            .await
    }

    /// Open a live view of a device
    ///
    /// # Errors
    ///
    /// Returns the relay's errors, or `Error::NotFound` for an unknown
    /// device when only registered devices are accepted
    pub async fn watch(&self, device_id: &str, camera: CameraFacing) -> Result<ViewerStream> {
        self.ensure_known(device_id).await?;
        self.relay.subscribe(device_id, camera).await
    }

    /// Ask a device for one still image
    ///
    /// # Errors
    ///
    /// Returns the relay's errors, or `Error::NotFound` for an unknown
    /// device when only registered devices are accepted
    pub async fn snapshot(
        &self,
        device_id: &str,
        camera: CameraFacing,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.ensure_known(device_id).await?;
        self.relay.snapshot(device_id, camera, timeout).await
    }

    /// Check that the store answers
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreUnavailable` if it does not
    pub async fn ready(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Close live views and stop device captures
    pub async fn shutdown(&self) {
        tracing::info!("broker shutting down");
        self.relay.shutdown().await;
    }

    async fn ensure_known(&self, device_id: &str) -> Result<()> {
        if self.require_known_device && !self.presence.exists(device_id).await? {
            return Err(Error::NotFound(format!("device {device_id} is not registered")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::SharedStore;

    fn broker_with(config: &Config) -> (MemoryStore, Broker) {
        let store = MemoryStore::new();
        let broker = Broker::new(Arc::new(store.clone()), config);
        (store, broker)
    }

    #[tokio::test]
    async fn unknown_devices_rejected_when_required() {
        let config = Config {
            require_known_device: true,
            ..Config::default()
        };
        let (store, broker) = broker_with(&config);

        assert!(matches!(
            broker.dispatch("ghost", "flashlight on", None).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            broker.watch("ghost", CameraFacing::Back).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(store.dump(), Value::Null);

        broker.presence().register("dev1", None).await.unwrap();
        broker.dispatch("dev1", "flashlight on", None).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_devices_accepted_by_default() {
        let (store, broker) = broker_with(&Config::default());
        broker.dispatch("dev1", "flashlight on", None).await.unwrap();
        assert!(store.dump()["commands"]["dev1"].is_object());
    }

    #[tokio::test(start_paused = true)]
    async fn configured_timeouts_reach_the_correlator() {
        let mut config = Config::default();
        config.timeouts.insert(RequestKind::Sms, Duration::from_millis(30));
        let (_store, broker) = broker_with(&config);

        assert_eq!(broker.correlator().timeout_for(RequestKind::Sms), Duration::from_millis(30));
        let started = tokio::time::Instant::now();
        let err = broker
            .request("dev1", RequestKind::Sms, json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn shutdown_stops_live_views() {
        let (store, broker) = broker_with(&Config::default());
        let _viewer = broker.watch("dev1", CameraFacing::Back).await.unwrap();
        broker.shutdown().await;

        assert!(broker.relay().watched_devices().is_empty());
        let commands = store.dump()["commands"]["dev1"].clone();
        let verbs: Vec<&str> = commands
            .as_object()
            .unwrap()
            .values()
            .filter_map(|c| c["command"].as_str())
            .collect();
        assert!(verbs.contains(&"stopCamera"));
    }

    #[tokio::test]
    async fn ready_follows_store() {
        let (store, broker) = broker_with(&Config::default());
        assert!(broker.ready().await.is_ok());
        store.set_offline(true);
        assert!(matches!(broker.ready().await, Err(Error::StoreUnavailable(_))));
        assert!(store.ping().await.is_err());
    }
}
