//! Shared store abstraction
//!
//! The broker and the devices never talk directly. Both sides read and write
//! a hierarchical JSON store and subscribe to changes in it. This module
//! defines the contract the broker relies on ([`SharedStore`]) plus two
//! backends:
//!
//! - [`MemoryStore`]: in-process tree, used for single-node deployments and tests
//! - [`FirebaseStore`]: Firebase Realtime Database over REST and server-sent events

pub mod firebase;
pub mod memory;
pub mod path;
pub mod tree;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

pub use firebase::{FirebaseConfig, FirebaseStore};
pub use memory::MemoryStore;
pub use path::{StorePath, validate_segment};
pub use tree::server_timestamp;

use crate::Result;

/// Shared handle to a store backend
pub type SharedStoreRef = Arc<dyn SharedStore>;

/// Change notification delivered to a [`Subscription`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Current value at a watched path (`None` when absent)
    Value(Option<Value>),
    /// A child appeared under a watched path
    ChildAdded { key: String, value: Value },
}

/// Hierarchical key/value store with path-scoped subscriptions
///
/// Plain writes are last-writer-wins. Notifications are at-least-once and
/// may repeat a value that was already observed.
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Short backend name for logs and readiness output
    fn backend(&self) -> &'static str;

    /// Read the value at `path`
    async fn get(&self, path: &StorePath) -> Result<Option<Value>>;

    /// Overwrite the value at `path`
    async fn set(&self, path: &StorePath, value: Value) -> Result<()>;

    /// Shallow-merge `fields` into the object at `path`
    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<()>;

    /// Append `value` under `path` with a server-assigned, time-ordered key
    ///
    /// Returns the new key.
    async fn push(&self, path: &StorePath, value: Value) -> Result<String>;

    /// Delete the value at `path`
    async fn remove(&self, path: &StorePath) -> Result<()>;

    /// Subscribe to the value at `path`
    ///
    /// The current value is delivered first, then every change.
    async fn watch_value(&self, path: &StorePath) -> Result<Subscription>;

    /// Subscribe to children appended under `path`
    ///
    /// Children present at subscription time are delivered first.
    async fn watch_children(&self, path: &StorePath) -> Result<Subscription>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<()>;
}

/// Live change subscription
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Result<StoreEvent>>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap a receiver and the teardown to run when the subscription ends
    #[must_use]
    pub fn new(
        rx: mpsc::UnboundedReceiver<Result<StoreEvent>>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Wait for the next event
    ///
    /// Returns `None` once the backend has closed the subscription.
    pub async fn next(&mut self) -> Option<Result<StoreEvent>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Current time in Unix milliseconds, the resolution server timestamps use
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
