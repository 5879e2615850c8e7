//! Store: the per-session half of the graph.
//!
//! Node definitions are shared through the [`Registry`](crate::Registry); a
//! store holds everything that belongs to one session:
//!
//! - the cache of settled and pending results, keyed by node key
//! - forward and reverse dependency edges
//! - the set of keys touched by the transaction in progress
//! - teardown callbacks of nodes initialized in this store
//! - change listeners
//!
//! The store is bookkeeping only. It never calls into nodes; the
//! [`Engine`](crate::Engine) drives it. All state sits behind one
//! `parking_lot::Mutex`, and callbacks are always invoked with the lock
//! released.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::handle::Key;
use crate::loadable::Loadable;
use crate::subscriber::{Subscriber, SubscriberId};
use crate::value::Value;

/// Cleanup returned by a node's init, run when the store goes away.
pub type Teardown = Box<dyn FnOnce() + Send>;

/// Unique identifier for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(u64);

impl StoreId {
    /// Allocate a fresh store ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the ID as a number.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct StoreState {
    cache: HashMap<Key, Loadable<Value>>,
    /// key -> keys it read during its last evaluation
    deps: HashMap<Key, IndexSet<Key>>,
    /// key -> keys that read it
    dependents: HashMap<Key, IndexSet<Key>>,
    dirty: IndexSet<Key>,
    teardowns: HashMap<Key, Option<Teardown>>,
    listeners: HashMap<Key, SmallVec<[Subscriber; 2]>>,
}

pub struct Store {
    id: StoreId,
    state: Mutex<StoreState>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            id: StoreId::new(),
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Get the store's unique ID.
    pub fn id(&self) -> StoreId {
        self.id
    }

    // ---- Cache ----

    /// Get the cached loadable for `key`.
    pub fn get_cache(&self, key: &Key) -> Option<Loadable<Value>> {
        self.state.lock().cache.get(key).cloned()
    }

    /// Cache a loadable for `key`.
    pub fn set_cache(&self, key: Key, loadable: Loadable<Value>) {
        self.state.lock().cache.insert(key, loadable);
    }

    /// Drop a cache entry. Returns `true` if there was one.
    pub fn del_cache(&self, key: &Key) -> bool {
        self.state.lock().cache.remove(key).is_some()
    }

    /// Whether `key` has a cache entry.
    pub fn has_cache(&self, key: &Key) -> bool {
        self.state.lock().cache.contains_key(key)
    }

    // ---- Teardowns ----

    /// Whether the node has been initialized in this store.
    pub fn has_teardown(&self, key: &Key) -> bool {
        self.state.lock().teardowns.contains_key(key)
    }

    /// Record the teardown to run when the store is dropped.
    pub fn set_teardown(&self, key: Key, teardown: Teardown) {
        self.state.lock().teardowns.insert(key, Some(teardown));
    }

    /// Remove every pending teardown. Keys stay marked as initialized.
    pub fn take_teardowns(&self) -> Vec<(Key, Teardown)> {
        let mut state = self.state.lock();
        state
            .teardowns
            .iter_mut()
            .filter_map(|(key, slot)| slot.take().map(|teardown| (key.clone(), teardown)))
            .collect()
    }

    // ---- Transaction bookkeeping ----

    /// Mark `key` as changed in the current transaction.
    pub fn dirty(&self, key: Key) {
        self.state.lock().dirty.insert(key);
    }

    /// Get the keys changed in the current transaction.
    pub fn dirty_keys(&self) -> Vec<Key> {
        self.state.lock().dirty.iter().cloned().collect()
    }

    /// Forget the changed keys.
    pub fn dirty_clear(&self) {
        self.state.lock().dirty.clear();
    }

    /// Dirty keys plus their direct dependents.
    pub fn downstream_keys(&self) -> IndexSet<Key> {
        let state = self.state.lock();
        let mut keys = IndexSet::with_capacity(state.dirty.len());
        for key in &state.dirty {
            keys.insert(key.clone());
            if let Some(dependents) = state.dependents.get(key) {
                keys.extend(dependents.iter().cloned());
            }
        }
        keys
    }

    // ---- Dependency edges ----

    /// Replace the dependency set of `key`, keeping reverse edges in sync.
    pub fn set_dep_keys(&self, key: &Key, new_deps: IndexSet<Key>) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let old_deps = state.deps.remove(key).unwrap_or_default();

        for dep in new_deps.iter().filter(|dep| !old_deps.contains(*dep)) {
            state
                .dependents
                .entry(dep.clone())
                .or_default()
                .insert(key.clone());
        }

        for dep in old_deps.iter().filter(|dep| !new_deps.contains(*dep)) {
            if let Some(dependents) = state.dependents.get_mut(dep) {
                dependents.shift_remove(key);
                if dependents.is_empty() {
                    state.dependents.remove(dep);
                }
            }
        }

        if !new_deps.is_empty() {
            state.deps.insert(key.clone(), new_deps);
        }
    }

    /// Get the keys `key` depends on.
    pub fn dep_keys(&self, key: &Key) -> IndexSet<Key> {
        self.state.lock().deps.get(key).cloned().unwrap_or_default()
    }

    /// Get the keys that depend on `key`.
    pub fn dependents(&self, key: &Key) -> IndexSet<Key> {
        self.state
            .lock()
            .dependents
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    // ---- Listeners ----

    /// Add a subscriber to `key`.
    pub fn subscribe(&self, key: Key, subscriber: Subscriber) -> SubscriberId {
        let id = subscriber.id();
        self.state
            .lock()
            .listeners
            .entry(key)
            .or_default()
            .push(subscriber);
        id
    }

    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, key: &Key, id: SubscriberId) -> bool {
        let mut state = self.state.lock();
        let Some(listeners) = state.listeners.get_mut(key) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|subscriber| subscriber.id() != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            state.listeners.remove(key);
        }
        removed
    }

    /// Get the number of subscribers to `key`.
    pub fn subscriber_count(&self, key: &Key) -> usize {
        self.state.lock().listeners.get(key).map_or(0, SmallVec::len)
    }

    /// Call every listener of `key`.
    pub fn emit(&self, key: &Key) {
        let listeners = match self.state.lock().listeners.get(key) {
            Some(listeners) => listeners.clone(),
            None => return,
        };
        tracing::trace!(key = %key, listeners = listeners.len(), "emitting change");
        for subscriber in &listeners {
            subscriber.notify();
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Store")
            .field("id", &self.id)
            .field("cached", &state.cache.len())
            .field("dirty", &state.dirty.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Arc;

    fn key(name: &str) -> Key {
        Key::from(name)
    }

    fn keys(names: &[&str]) -> IndexSet<Key> {
        names.iter().map(|name| key(name)).collect()
    }

    #[test]
    fn cache_round_trip() {
        let store = Store::new();
        assert!(!store.has_cache(&key("a")));

        store.set_cache(key("a"), Loadable::Resolved(Value::new(1)));
        assert_eq!(store.get_cache(&key("a")), Some(Loadable::Resolved(Value::new(1))));

        assert!(store.del_cache(&key("a")));
        assert!(!store.del_cache(&key("a")));
    }

    #[test]
    fn dep_keys_keep_reverse_edges_in_sync() {
        let store = Store::new();
        store.set_dep_keys(&key("sum"), keys(&["a", "b"]));
        assert_eq!(store.dependents(&key("a")), keys(&["sum"]));
        assert_eq!(store.dependents(&key("b")), keys(&["sum"]));

        store.set_dep_keys(&key("sum"), keys(&["b", "c"]));
        assert!(store.dependents(&key("a")).is_empty());
        assert_eq!(store.dependents(&key("c")), keys(&["sum"]));
        assert_eq!(store.dep_keys(&key("sum")), keys(&["b", "c"]));
    }

    #[test]
    fn downstream_is_one_level() {
        let store = Store::new();
        store.set_dep_keys(&key("double"), keys(&["count"]));
        store.set_dep_keys(&key("quad"), keys(&["double"]));

        store.dirty(key("count"));
        assert_eq!(store.downstream_keys(), keys(&["count", "double"]));

        store.dirty_clear();
        assert!(store.downstream_keys().is_empty());
    }

    #[test]
    fn emit_reaches_only_current_listeners() {
        let store = Store::new();
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let id = store.subscribe(
            key("a"),
            Subscriber::new(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        store.emit(&key("a"));
        store.emit(&key("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(store.unsubscribe(&key("a"), id));
        assert!(!store.unsubscribe(&key("a"), id));
        store.emit(&key("a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(&key("a")), 0);
    }

    #[test]
    fn teardowns_are_taken_once() {
        let store = Store::new();
        let ran = Arc::new(AtomicI32::new(0));
        let ran_clone = ran.clone();

        store.set_teardown(
            key("a"),
            Box::new(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for (_, teardown) in store.take_teardowns() {
            teardown();
        }
        assert!(store.take_teardowns().is_empty());
        assert!(store.has_teardown(&key("a")));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
