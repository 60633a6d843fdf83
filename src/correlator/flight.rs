//! Per-key single-flight guards

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Arena of per-key mutexes
///
/// A caller holding the guard for a key is the only one in flight for it;
/// later callers queue in FIFO order. Slots are dropped once nobody holds
/// or waits on them.
#[derive(Debug)]
pub struct SingleFlight<K: Eq + Hash> {
    slots: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    /// Create an empty arena
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the key's slot until `deadline`
    ///
    /// Returns `None` if the deadline passed while queued.
    pub async fn acquire_until(&self, key: K, deadline: Instant) -> Option<FlightGuard<'_, K>> {
        let slot = Arc::clone(&*self.slots.entry(key.clone()).or_default());

        match tokio::time::timeout_at(deadline, slot.lock_owned()).await {
            Ok(permit) => Some(FlightGuard {
                owner: self,
                key,
                permit: Some(permit),
            }),
            Err(_) => {
                self.release(&key);
                None
            }
        }
    }

    /// Number of keys with a holder or waiters
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    fn release(&self, key: &K) {
        self.slots.remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// Exclusive hold on one key; released on drop
#[derive(Debug)]
pub struct FlightGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a SingleFlight<K>,
    key: K,
    permit: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for FlightGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.owner.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_caller_waits_for_first() {
        let flights = SingleFlight::new();
        let far = Instant::now() + Duration::from_secs(10);

        let first = flights.acquire_until("k", far).await.unwrap();
        let near = Instant::now() + Duration::from_millis(20);
        assert!(flights.acquire_until("k", near).await.is_none());

        // A different key is independent
        let far = Instant::now() + Duration::from_secs(10);
        assert!(flights.acquire_until("other", far).await.is_some());

        drop(first);
        assert!(flights.acquire_until("k", far).await.is_some());
    }

    #[tokio::test]
    async fn slots_are_reclaimed() {
        let flights = SingleFlight::new();
        let far = Instant::now() + Duration::from_secs(10);
        {
            let _guard = flights.acquire_until(("dev1", 1), far).await.unwrap();
            assert_eq!(flights.in_flight(), 1);
        }
        assert_eq!(flights.in_flight(), 0);
    }
}
