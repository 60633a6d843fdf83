//! In-process store backend

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{SharedStore, StoreEvent, StorePath, Subscription, now_ms, tree};
use crate::{Error, Result};

/// Shared JSON tree living inside the broker process
///
/// Cloning is cheap and every clone sees the same data. Watchers are
/// notified synchronously on the writing task, in write order.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    root: Value,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,
    /// Last push key parts: (milliseconds, sequence within that millisecond)
    last_push: (i64, u32),
    offline: bool,
    released: u64,
}

#[derive(Debug)]
struct Watcher {
    path: StorePath,
    tx: mpsc::UnboundedSender<Result<StoreEvent>>,
    seen: Seen,
}

#[derive(Debug)]
enum Seen {
    Value(Option<Value>),
    Children(BTreeSet<String>),
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the store
    ///
    /// While offline every operation fails with `StoreUnavailable` and each
    /// live subscription receives one error event.
    pub fn set_offline(&self, offline: bool) {
        let mut inner = self.lock();
        inner.offline = offline;
        if offline {
            for watcher in inner.watchers.values() {
                let _ = watcher
                    .tx
                    .send(Err(Error::StoreUnavailable("memory store offline".to_string())));
            }
        }
    }

    /// Number of subscriptions currently registered
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.lock().watchers.len()
    }

    /// Number of subscriptions torn down since the store was created
    #[must_use]
    pub fn released_subscriptions(&self) -> u64 {
        self.lock().released
    }

    /// Copy of the whole tree
    #[must_use]
    pub fn dump(&self) -> Value {
        self.lock().root.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock();
        if inner.offline {
            return Err(Error::StoreUnavailable("memory store offline".to_string()));
        }
        Ok(inner)
    }

    fn write(&self, path: &StorePath, apply: impl FnOnce(&mut Value)) -> Result<()> {
        let mut inner = self.online()?;
        apply(&mut inner.root);
        inner.notify(path);
        Ok(())
    }

    fn subscribe(&self, path: &StorePath, children: bool) -> Result<Subscription> {
        let mut inner = self.online()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let seen = if children {
            let keys = tree::child_keys(&inner.root, path.segments());
            for key in &keys {
                let mut child = path.segments().to_vec();
                child.push(key.clone());
                let value = tree::get_at(&inner.root, &child).cloned().unwrap_or(Value::Null);
                let _ = tx.send(Ok(StoreEvent::ChildAdded {
                    key: key.clone(),
                    value,
                }));
            }
            Seen::Children(keys.into_iter().collect())
        } else {
            let current = tree::get_at(&inner.root, path.segments()).cloned();
            let _ = tx.send(Ok(StoreEvent::Value(current.clone())));
            Seen::Value(current)
        };

        let id = inner.next_watcher;
        inner.next_watcher += 1;
        inner.watchers.insert(
            id,
            Watcher {
                path: path.clone(),
                tx,
                seen,
            },
        );
        drop(inner);

        tracing::trace!(path = %path, id, children, "memory store subscription opened");

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.shared);
        Ok(Subscription::new(rx, move || {
            if let Some(shared) = weak.upgrade() {
                let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if inner.watchers.remove(&id).is_some() {
                    inner.released += 1;
                }
            }
        }))
    }

    fn next_push_key(inner: &mut Inner) -> String {
        let now = now_ms();
        if now > inner.last_push.0 {
            inner.last_push = (now, 0);
        } else {
            inner.last_push.1 += 1;
        }
        let (ms, seq) = inner.last_push;
        format!("-{ms:013}{seq:06}")
    }
}

impl Inner {
    /// Deliver changes to every watcher whose view overlaps `changed`
    fn notify(&mut self, changed: &StorePath) {
        let root = &self.root;
        for watcher in self.watchers.values_mut() {
            if !watcher.path.overlaps(changed) {
                continue;
            }
            match &mut watcher.seen {
                Seen::Value(last) => {
                    let current = tree::get_at(root, watcher.path.segments()).cloned();
                    if *last != current {
                        let _ = watcher.tx.send(Ok(StoreEvent::Value(current.clone())));
                        *last = current;
                    }
                }
                Seen::Children(known) => {
                    let keys = tree::child_keys(root, watcher.path.segments());
                    for key in keys.iter().filter(|k| !known.contains(*k)) {
                        let mut child = watcher.path.segments().to_vec();
                        child.push(key.clone());
                        let value = tree::get_at(root, &child).cloned().unwrap_or(Value::Null);
                        let _ = watcher.tx.send(Ok(StoreEvent::ChildAdded {
                            key: key.clone(),
                            value,
                        }));
                    }
                    *known = keys.into_iter().collect();
                }
            }
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, path: &StorePath) -> Result<Option<Value>> {
        let inner = self.online()?;
        Ok(tree::get_at(&inner.root, path.segments()).cloned())
    }

    async fn set(&self, path: &StorePath, value: Value) -> Result<()> {
        let value = tree::resolve_server_values(value, now_ms());
        self.write(path, |root| tree::set_at(root, path.segments(), value))
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<()> {
        let now = now_ms();
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k, tree::resolve_server_values(v, now)))
            .collect();
        self.write(path, |root| tree::merge_at(root, path.segments(), fields))
    }

    async fn push(&self, path: &StorePath, value: Value) -> Result<String> {
        let mut inner = self.online()?;
        let key = Self::next_push_key(&mut inner);
        let child = path.child(&key)?;
        let value = tree::resolve_server_values(value, now_ms());
        tree::set_at(&mut inner.root, child.segments(), value);
        inner.notify(&child);
        Ok(key)
    }

    async fn remove(&self, path: &StorePath) -> Result<()> {
        self.write(path, |root| tree::remove_at(root, path.segments()))
    }

    async fn watch_value(&self, path: &StorePath) -> Result<Subscription> {
        self.subscribe(path, false)
    }

    async fn watch_children(&self, path: &StorePath) -> Result<Subscription> {
        self.subscribe(path, true)
    }

    async fn ping(&self) -> Result<()> {
        self.online().map(drop)
    }
}
