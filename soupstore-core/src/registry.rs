//! Registry of live store handles
//!
//! Maps each canonical store name to at most one live handle. Creation is
//! single-flight per name: the map lock is held only long enough to find or
//! insert a per-name slot, and the (possibly slow) factory runs under that
//! slot's own lock. Callers for different names never wait on each other.

use crate::errors::{handle_poison, StoreResult};
use crate::naming::StoreName;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

enum Slot<H> {
    /// No handle yet
    Empty,
    Ready(Arc<H>),
    /// Removed from the map, or its factory failed; anyone still holding
    /// the slot must look again
    Evicted,
}

type SlotRef<H> = Arc<Mutex<Slot<H>>>;

/// Cache of live handles keyed by store name
pub struct StoreRegistry<H> {
    slots: Mutex<HashMap<StoreName, SlotRef<H>>>,
}

impl<H> StoreRegistry<H> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached handle for `name`, or build one with `create`.
    ///
    /// `create` runs at most once per name at a time; concurrent callers for
    /// the same name block until it finishes and then share its result. If it
    /// fails, the error goes to that caller only and the next caller retries.
    pub fn get_or_create<F>(&self, name: &StoreName, create: F) -> StoreResult<Arc<H>>
    where
        F: FnOnce() -> StoreResult<H>,
    {
        loop {
            let slot = {
                let mut slots = self.slots.lock().map_err(handle_poison)?;
                slots
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(Slot::Empty)))
                    .clone()
            };

            let mut state = slot.lock().map_err(handle_poison)?;
            if let Slot::Ready(handle) = &*state {
                return Ok(handle.clone());
            }
            // Lost a race with remove; the map no longer holds this slot
            if matches!(*state, Slot::Evicted) {
                continue;
            }

            debug!(store = %name, "Creating store handle");
            return match create() {
                Ok(handle) => {
                    let handle = Arc::new(handle);
                    *state = Slot::Ready(handle.clone());
                    Ok(handle)
                }
                Err(e) => {
                    // Waiters on this slot start over with a fresh one
                    *state = Slot::Evicted;
                    self.discard(name, &slot);
                    Err(e)
                }
            };
        }
    }

    /// Drop `slot` from the map if it is still the entry for `name`.
    ///
    /// Called with the slot lock held; no path waits on a slot lock while
    /// holding the map lock, so the order is safe.
    fn discard(&self, name: &StoreName, slot: &SlotRef<H>) {
        if let Ok(mut slots) = self.slots.lock() {
            if slots.get(name).is_some_and(|current| Arc::ptr_eq(current, slot)) {
                slots.remove(name);
            }
        }
    }

    /// Cached handle for `name`, without creating one
    pub fn get(&self, name: &StoreName) -> StoreResult<Option<Arc<H>>> {
        let slot = match self.slots.lock().map_err(handle_poison)?.get(name) {
            Some(slot) => slot.clone(),
            None => return Ok(None),
        };
        let state = slot.lock().map_err(handle_poison)?;
        Ok(match &*state {
            Slot::Ready(handle) => Some(handle.clone()),
            _ => None,
        })
    }

    /// Remove and return the handle for `name`, if any
    pub fn remove(&self, name: &StoreName) -> StoreResult<Option<Arc<H>>> {
        let slot = self.slots.lock().map_err(handle_poison)?.remove(name);
        match slot {
            Some(slot) => Self::evict(&slot),
            None => Ok(None),
        }
    }

    /// Remove every entry whose name satisfies `predicate`; returns the removed handles
    pub fn remove_where<P>(&self, predicate: P) -> StoreResult<Vec<(StoreName, Arc<H>)>>
    where
        P: Fn(&StoreName) -> bool,
    {
        let removed: Vec<(StoreName, SlotRef<H>)> = {
            let mut slots = self.slots.lock().map_err(handle_poison)?;
            let names: Vec<StoreName> = slots.keys().filter(|n| predicate(n)).cloned().collect();
            names
                .into_iter()
                .filter_map(|name| slots.remove(&name).map(|slot| (name, slot)))
                .collect()
        };

        // Slot locks are taken after the map lock is released
        let mut handles = Vec::with_capacity(removed.len());
        for (name, slot) in removed {
            if let Some(handle) = Self::evict(&slot)? {
                handles.push((name, handle));
            }
        }
        Ok(handles)
    }

    /// Read-only copy of every live handle
    pub fn snapshot(&self) -> StoreResult<HashMap<StoreName, Arc<H>>> {
        let slots: Vec<(StoreName, SlotRef<H>)> = self
            .slots
            .lock()
            .map_err(handle_poison)?
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();

        let mut snapshot = HashMap::with_capacity(slots.len());
        for (name, slot) in slots {
            if let Slot::Ready(handle) = &*slot.lock().map_err(handle_poison)? {
                snapshot.insert(name, handle.clone());
            }
        }
        Ok(snapshot)
    }

    /// Number of live handles
    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.snapshot()?.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Waits for any in-flight creation on the slot, then marks it evicted
    fn evict(slot: &SlotRef<H>) -> StoreResult<Option<Arc<H>>> {
        let mut state = slot.lock().map_err(handle_poison)?;
        Ok(match std::mem::replace(&mut *state, Slot::Evicted) {
            Slot::Ready(handle) => Some(handle),
            Slot::Empty | Slot::Evicted => None,
        })
    }
}

impl<H> Default for StoreRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::naming::derive_store_name;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn name(prefix: &str) -> StoreName {
        derive_store_name(prefix, None).unwrap()
    }

    #[test]
    fn test_get_or_create_caches() {
        let registry = StoreRegistry::new();
        let calls = AtomicUsize::new(0);

        let a = registry
            .get_or_create(&name("a"), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1u32)
            })
            .unwrap();
        let b = registry
            .get_or_create(&name("a"), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(2u32)
            })
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_single_flight() {
        let registry = Arc::new(StoreRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry
                        .get_or_create(&name("shared"), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok(String::from("handle"))
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<Arc<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for r in &results {
            assert!(Arc::ptr_eq(r, &results[0]));
        }
    }

    #[test]
    fn test_different_names_do_not_block() {
        let registry = Arc::new(StoreRegistry::new());
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let slow = {
            let registry = registry.clone();
            thread::spawn(move || {
                registry
                    .get_or_create(&name("slow"), || {
                        started_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(1u8)
                    })
                    .unwrap();
            })
        };

        started_rx.recv().unwrap();
        // Completes while "slow" is still inside its factory
        let fast = registry.get_or_create(&name("fast"), || Ok(2u8)).unwrap();
        assert_eq!(*fast, 2);

        release_tx.send(()).unwrap();
        slow.join().unwrap();
        assert_eq!(registry.len().unwrap(), 2);
    }

    #[test]
    fn test_failed_creation_is_retried() {
        let registry: StoreRegistry<u8> = StoreRegistry::new();

        let err = registry.get_or_create(&name("x"), || Err(StoreError::Database("boom".to_string())));
        assert!(err.is_err());
        assert!(registry.get(&name("x")).unwrap().is_none());
        assert!(registry.slots.lock().unwrap().is_empty());

        let ok = registry.get_or_create(&name("x"), || Ok(5)).unwrap();
        assert_eq!(*ok, 5);
    }

    #[test]
    fn test_failed_names_leave_no_entries() {
        let registry: StoreRegistry<u8> = StoreRegistry::new();
        for i in 0..100 {
            let result = registry.get_or_create(&name(&format!("bad{i}")), || {
                Err(StoreError::InvalidName("rejected".to_string()))
            });
            assert!(result.is_err());
        }
        assert!(registry.slots.lock().unwrap().is_empty());
        assert!(registry.is_empty().unwrap());
    }

    #[test]
    fn test_waiter_retries_after_failed_creation() {
        let registry: Arc<StoreRegistry<u8>> = Arc::new(StoreRegistry::new());
        let started = Arc::new(Barrier::new(2));

        let failing = {
            let registry = registry.clone();
            let started = started.clone();
            thread::spawn(move || {
                registry.get_or_create(&name("x"), || {
                    started.wait();
                    thread::sleep(Duration::from_millis(50));
                    Err(StoreError::Database("boom".to_string()))
                })
            })
        };

        started.wait();
        let handle = registry.get_or_create(&name("x"), || Ok(7)).unwrap();
        assert_eq!(*handle, 7);
        assert!(failing.join().unwrap().is_err());
        assert_eq!(registry.slots.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_remove() {
        let registry = StoreRegistry::new();
        let created = registry.get_or_create(&name("a"), || Ok(1u8)).unwrap();

        let removed = registry.remove(&name("a")).unwrap().unwrap();
        assert!(Arc::ptr_eq(&created, &removed));
        assert!(registry.remove(&name("a")).unwrap().is_none());
        assert!(registry.get(&name("a")).unwrap().is_none());

        let recreated = registry.get_or_create(&name("a"), || Ok(2u8)).unwrap();
        assert_eq!(*recreated, 2);
    }

    #[test]
    fn test_remove_where_and_snapshot() {
        let registry = StoreRegistry::new();
        for prefix in ["user_a", "user_b", "global"] {
            registry.get_or_create(&name(prefix), || Ok(prefix.to_string())).unwrap();
        }

        let removed = registry
            .remove_where(|n| n.as_str().starts_with("user_"))
            .unwrap();
        assert_eq!(removed.len(), 2);

        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&name("global")));
    }

    #[test]
    fn test_remove_waits_for_inflight_creation() {
        let registry = Arc::new(StoreRegistry::new());
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        let creator = {
            let registry = registry.clone();
            thread::spawn(move || {
                registry
                    .get_or_create(&name("busy"), || {
                        started_tx.send(()).unwrap();
                        thread::sleep(Duration::from_millis(50));
                        Ok(9u8)
                    })
                    .unwrap()
            })
        };

        started_rx.recv().unwrap();
        let removed = registry.remove(&name("busy")).unwrap();
        let created = creator.join().unwrap();

        // The handle built during removal is the one handed back for closing
        assert!(Arc::ptr_eq(&removed.unwrap(), &created));
        assert!(registry.is_empty().unwrap());
    }
}
