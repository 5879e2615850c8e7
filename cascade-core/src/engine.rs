//! Engine: reads, writes and change propagation for one store.
//!
//! An engine pairs a shared [`Registry`] with a private [`Store`]. Every
//! session (a test, a request, a UI root) gets its own engine, and engines
//! never see each other's values.
//!
//! # How Writes Work
//!
//! 1. A write (`set`, `update`, `reset`, `set_loadable`, `mark_modified`)
//!    becomes an [`Action`]. Writes to missing or read-only nodes are rejected
//!    right here, at the call site.
//!
//! 2. Outside a transaction the action is applied immediately. Inside one it
//!    is queued until the outermost transaction closes.
//!
//! 3. Applying actions writes node results into the store cache and marks the
//!    touched keys dirty.
//!
//! 4. The invalidation pass then walks downstream: every dirty key and every
//!    dependent of a dirty key is invalidated. A selector that drops its cache
//!    entry becomes dirty itself, so the pass repeats until no new key shows
//!    up. This reaches every transitive dependent.
//!
//! 5. Subscribers of every reached key are notified once, and the dirty set
//!    is cleared.
//!
//! # Lifetime
//!
//! `Engine` is a cheap handle; clones share the store. When the last clone
//! is dropped, every node teardown recorded in the store runs. Async
//! continuations hold a [`WeakEngine`] and stand down once it is gone.

use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use parking_lot::Mutex;

use crate::error::StateError;
use crate::handle::{Handle, Key};
use crate::loadable::Loadable;
use crate::node::{NewValue, Node, NodeWrites};
use crate::registry::Registry;
use crate::store::{Store, StoreId};
use crate::subscriber::{Subscriber, SubscriberId};
use crate::transaction::BatchState;
use crate::value::{StateValue, Value};

type Updater = Box<dyn FnOnce(Value) -> Result<NewValue<Value>, StateError> + Send>;

/// How a `SetValue` action computes the value to write.
pub(crate) enum Update {
    Replace(NewValue<Value>),
    With(Updater),
}

/// A queued write.
pub(crate) enum Action {
    SetValue { key: Key, update: Update },
    SetLoadable { key: Key, loadable: Loadable<Value> },
    MarkModified { key: Key },
}

impl Action {
    fn key(&self) -> &Key {
        match self {
            Action::SetValue { key, .. }
            | Action::SetLoadable { key, .. }
            | Action::MarkModified { key } => key,
        }
    }
}

pub(crate) struct EngineInner {
    registry: Arc<Registry>,
    store: Store,
    pub(crate) batch: Mutex<BatchState>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let teardowns = self.store.take_teardowns();
        tracing::debug!(store = self.store.id().raw(), nodes = teardowns.len(), "tearing down store");
        for (_, teardown) in teardowns {
            teardown();
        }
    }
}

/// Reads and writes node values in one store.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Non-owning engine reference for async continuations.
#[derive(Clone)]
pub(crate) struct WeakEngine(Weak<EngineInner>);

impl WeakEngine {
    pub(crate) fn upgrade(&self) -> Option<Engine> {
        self.0.upgrade().map(|inner| Engine { inner })
    }
}

impl Engine {
    /// Create an engine with its own store over a shared registry.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                store: Store::new(),
                batch: Mutex::new(BatchState::default()),
            }),
        }
    }

    /// Get the registry this engine reads nodes from.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Get this engine's store.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Get the store's unique ID.
    pub fn id(&self) -> StoreId {
        self.inner.store.id()
    }

    pub(crate) fn downgrade(&self) -> WeakEngine {
        WeakEngine(Arc::downgrade(&self.inner))
    }

    pub(crate) fn batch_state(&self) -> &Mutex<BatchState> {
        &self.inner.batch
    }

    /// Run the node's init once for this store.
    fn initialize(&self, key: &Key, node: &Arc<dyn Node>) {
        if self.store().has_teardown(key) {
            return;
        }
        tracing::debug!(key = %key, store = self.id().raw(), kind = ?node.kind(), "initializing node");
        let teardown = node.init(self);
        self.store().set_teardown(key.clone(), teardown);
    }

    // ---- Reads ----

    /// Current loadable of a node, initializing it in this store if needed.
    pub fn get_node_loadable(&self, key: &Key) -> Result<Loadable<Value>, StateError> {
        let node = self.registry().node(key)?;
        self.initialize(key, &node);
        Ok(node.get(self))
    }

    /// Entry point for external reads.
    pub fn get_state_loadable(&self, key: &Key) -> Result<Loadable<Value>, StateError> {
        tracing::trace!(key = %key, "reading state");
        self.get_node_loadable(key)
    }

    /// Typed read.
    pub fn get<T: StateValue>(&self, handle: &Handle<T>) -> Result<Loadable<T>, StateError> {
        Ok(self.get_state_loadable(handle.key())?.downcast())
    }

    /// Untyped read by key.
    pub fn get_snapshot(&self, key: &Key) -> Result<Loadable<Value>, StateError> {
        self.get_state_loadable(key)
    }

    // ---- Writes ----

    /// Compute the writes a new value produces, without applying them.
    pub fn set_node_value(
        &self,
        key: &Key,
        value: NewValue<Value>,
    ) -> Result<NodeWrites, StateError> {
        let node = self.registry().node(key)?;
        if !node.is_writable() {
            return Err(StateError::ReadOnly { key: key.clone() });
        }
        self.initialize(key, &node);
        node.set(self, value)
    }

    /// Write a value to a writable node.
    pub fn set<T: StateValue>(&self, handle: &Handle<T>, value: T) -> Result<(), StateError> {
        self.check_writable(handle.key())?;
        self.submit(Action::SetValue {
            key: handle.key().clone(),
            update: Update::Replace(NewValue::Value(value).erase()),
        })
    }

    /// Write a value computed from the current one.
    ///
    /// Fails with [`StateError::PendingUpdate`] if the current value is still
    /// pending, and with [`StateError::Failed`] if it failed.
    pub fn update<T, F>(&self, handle: &Handle<T>, f: F) -> Result<(), StateError>
    where
        T: StateValue,
        F: FnOnce(T) -> T + Send + 'static,
    {
        self.check_writable(handle.key())?;
        let updater: Updater =
            Box::new(move |current| Ok(NewValue::Value(f(current.cast::<T>()?)).erase()));
        self.submit(Action::SetValue {
            key: handle.key().clone(),
            update: Update::With(updater),
        })
    }

    /// Return the node to its default.
    pub fn reset<T: StateValue>(&self, handle: &Handle<T>) -> Result<(), StateError> {
        self.check_writable(handle.key())?;
        self.submit(Action::SetValue {
            key: handle.key().clone(),
            update: Update::Replace(NewValue::Reset),
        })
    }

    /// Write a loadable straight into the cache, bypassing the node's setter.
    pub fn set_loadable<T: StateValue>(
        &self,
        handle: &Handle<T>,
        loadable: Loadable<T>,
    ) -> Result<(), StateError> {
        self.check_writable(handle.key())?;
        self.submit(Action::SetLoadable {
            key: handle.key().clone(),
            loadable: loadable.erase(),
        })
    }

    /// Mark a node changed so its dependents are invalidated and notified.
    pub fn mark_modified<T>(&self, handle: &Handle<T>) -> Result<(), StateError> {
        self.registry().node(handle.key())?;
        self.submit(Action::MarkModified {
            key: handle.key().clone(),
        })
    }

    pub(crate) fn mark_key_modified(&self, key: &Key) {
        let action = Action::MarkModified { key: key.clone() };
        if let Err(err) = self.submit(action) {
            tracing::warn!(key = %key, error = %err, "failed to mark node modified");
        }
    }

    /// Drop the node's cached result, and those of everything it read.
    pub fn refresh<T>(&self, handle: &Handle<T>) -> Result<(), StateError> {
        let node = self.registry().node(handle.key())?;
        node.clear_cache(self);
        Ok(())
    }

    // ---- Subscriptions ----

    /// Call `on_change` whenever the node may have changed.
    pub fn subscribe<T, F>(&self, handle: &Handle<T>, on_change: F) -> SubscriberId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.store()
            .subscribe(handle.key().clone(), Subscriber::new(on_change))
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe<T>(&self, handle: &Handle<T>, id: SubscriberId) -> bool {
        self.store().unsubscribe(handle.key(), id)
    }

    // ---- Applying actions ----

    fn check_writable(&self, key: &Key) -> Result<(), StateError> {
        if self.registry().node(key)?.is_writable() {
            Ok(())
        } else {
            Err(StateError::ReadOnly { key: key.clone() })
        }
    }

    /// Queue the action if a transaction is open, otherwise apply it now.
    fn submit(&self, action: Action) -> Result<(), StateError> {
        {
            let mut batch = self.batch_state().lock();
            if batch.depth > 0 {
                tracing::trace!(key = %action.key(), "queued action");
                batch.queued.push(action);
                return Ok(());
            }
        }
        self.apply_actions(vec![action])
    }

    /// Apply actions in order, then invalidate and notify downstream.
    ///
    /// Stops at the first failing action. The invalidation and notification
    /// pass still runs for whatever was applied before it.
    pub(crate) fn apply_actions(&self, actions: Vec<Action>) -> Result<(), StateError> {
        let count = actions.len();
        let mut outcome = Ok(());
        for action in actions {
            if let Err(err) = self.apply_action(action) {
                outcome = Err(err);
                break;
            }
        }

        let reached = self.invalidate_downstream();
        for key in &reached {
            self.store().emit(key);
        }
        self.store().dirty_clear();

        tracing::debug!(
            store = self.id().raw(),
            actions = count,
            downstream = reached.len(),
            "applied transaction"
        );
        outcome
    }

    fn apply_action(&self, action: Action) -> Result<(), StateError> {
        match action {
            Action::SetValue { key, update } => {
                let value = self.resolve_update(&key, update)?;
                let writes = self.set_node_value(&key, value)?;
                for (key, loadable) in writes {
                    self.write_loadable(key, loadable);
                }
            }
            Action::SetLoadable { key, loadable } => self.write_loadable(key, loadable),
            Action::MarkModified { key } => self.store().dirty(key),
        }
        Ok(())
    }

    fn resolve_update(&self, key: &Key, update: Update) -> Result<NewValue<Value>, StateError> {
        match update {
            Update::Replace(value) => Ok(value),
            Update::With(updater) => match self.get_node_loadable(key)? {
                Loadable::Resolved(current) => updater(current),
                Loadable::Pending(_) => Err(StateError::PendingUpdate { key: key.clone() }),
                Loadable::Failed(failure) => Err(StateError::Failed(failure)),
            },
        }
    }

    fn write_loadable(&self, key: Key, loadable: Loadable<Value>) {
        match &loadable {
            Loadable::Resolved(value) if value.is_unset() => {
                self.store().del_cache(&key);
            }
            _ => self.store().set_cache(key.clone(), loadable),
        }
        self.store().dirty(key);
    }

    /// Invalidate every key reachable from the dirty set. Returns them all.
    fn invalidate_downstream(&self) -> IndexSet<Key> {
        let mut reached: IndexSet<Key> = IndexSet::new();
        loop {
            let fresh: Vec<Key> = self
                .store()
                .downstream_keys()
                .into_iter()
                .filter(|key| !reached.contains(key))
                .collect();
            if fresh.is_empty() {
                return reached;
            }
            for key in fresh {
                if let Some(node) = self.registry().node_maybe(&key) {
                    node.invalidate(self);
                }
                reached.insert(key);
            }
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.id().raw())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::selector::Selector;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn setup() -> (Arc<Registry>, Engine) {
        let registry = Arc::new(Registry::new());
        let engine = Engine::new(registry.clone());
        (registry, engine)
    }

    #[test]
    fn set_then_get() {
        let (registry, engine) = setup();
        let count = registry.atom(Atom::new("count").default(0)).unwrap();

        assert_eq!(engine.get(&count).unwrap().value(), Some(&0));
        engine.set(&count, 5).unwrap();
        assert_eq!(engine.get(&count).unwrap().value(), Some(&5));
    }

    #[test]
    fn update_uses_current_value() {
        let (registry, engine) = setup();
        let count = registry.atom(Atom::new("count").default(10)).unwrap();

        engine.update(&count, |v| v + 5).unwrap();
        assert_eq!(engine.get(&count).unwrap().value(), Some(&15));
    }

    #[test]
    fn update_against_pending_is_rejected() {
        let (registry, engine) = setup();
        let later = registry.atom(Atom::<i32>::new("later")).unwrap();

        let err = engine.update(&later, |v| v + 1).unwrap_err();
        assert!(matches!(err, StateError::PendingUpdate { .. }));
    }

    #[test]
    fn writes_to_read_only_nodes_fail_at_the_call_site() {
        let (registry, engine) = setup();
        let total = registry
            .selector(Selector::new("total", |_| Ok(1)))
            .unwrap();

        let err = engine.set(&total, 2).unwrap_err();
        assert!(matches!(err, StateError::ReadOnly { .. }));
    }

    #[test]
    fn missing_nodes_fail_at_the_call_site() {
        let (_registry, engine) = setup();
        let err = engine.get_snapshot(&Key::from("ghost")).unwrap_err();
        assert!(matches!(err, StateError::NodeMissing { .. }));
    }

    #[test]
    fn subscribers_fire_for_transitive_dependents() {
        let (registry, engine) = setup();
        let count = registry.atom(Atom::new("count").default(1)).unwrap();
        let c = count.clone();
        let double = registry
            .selector(Selector::new("double", move |get| Ok(get.get(&c)? * 2)))
            .unwrap();
        let d = double.clone();
        let quad = registry
            .selector(Selector::new("quad", move |get| Ok(get.get(&d)? * 2)))
            .unwrap();

        assert_eq!(engine.get(&quad).unwrap().value(), Some(&4));

        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        engine.subscribe(&quad, move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        engine.set(&count, 2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.get(&quad).unwrap().value(), Some(&8));
    }

    #[test]
    fn engines_do_not_share_values() {
        let registry = Arc::new(Registry::new());
        let count = registry.atom(Atom::new("count").default(0)).unwrap();

        let first = Engine::new(registry.clone());
        let second = Engine::new(registry);
        first.set(&count, 9).unwrap();

        assert_eq!(first.get(&count).unwrap().value(), Some(&9));
        assert_eq!(second.get(&count).unwrap().value(), Some(&0));
    }
}
