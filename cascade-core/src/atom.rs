//! Atoms: writable root nodes.
//!
//! An atom holds whatever was last written to it in a store, or its default
//! when nothing was. The default can be:
//!
//! - a plain value
//! - a future or loadable (the atom reads as pending until it settles)
//! - another node's handle, in which case the atom follows that node until
//!   it is written to and goes back to following it when reset
//! - nothing at all, in which case the atom stays pending until written
//!
//! ```rust,ignore
//! let count = registry.atom(Atom::new("count").default(0))?;
//! let draft = registry.atom(Atom::new("draft").default_handle(&saved))?;
//! ```

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::Engine;
use crate::error::{Failure, StateError};
use crate::handle::{Handle, Key};
use crate::loadable::{spawn_detached, Loadable, Pending};
use crate::node::{NewValue, Node, NodeKind, NodeWrites};
use crate::registry::{DuplicateKeyPolicy, Registry};
use crate::selector::{compute_fn, write_fn, Raw, SelectorNode};
use crate::store::Teardown;
use crate::value::{StateValue, Value};

/// What an atom reads as before anything is written to it.
pub enum AtomDefault<T> {
    Value(T),
    Loadable(Loadable<T>),
    Fallback(Handle<T>),
}

/// Atom definition, registered with [`Registry::atom`].
pub struct Atom<T> {
    key: Key,
    default: Option<AtomDefault<T>>,
}

impl<T: StateValue> Atom<T> {
    /// Start building an atom with no default.
    pub fn new(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            default: None,
        }
    }

    /// Default to a plain value.
    pub fn default(self, value: T) -> Self {
        self.with(AtomDefault::Value(value))
    }

    /// Default to the outcome of a future.
    pub fn default_future<F>(self, future: F) -> Self
    where
        F: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        self.with(AtomDefault::Loadable(Loadable::from_future(future)))
    }

    /// Default to a loadable in any state.
    pub fn default_loadable(self, loadable: Loadable<T>) -> Self {
        self.with(AtomDefault::Loadable(loadable))
    }

    /// Follow another node until written to.
    pub fn default_handle(self, fallback: &Handle<T>) -> Self {
        self.with(AtomDefault::Fallback(fallback.clone()))
    }

    /// Set the default directly.
    pub fn with(mut self, default: AtomDefault<T>) -> Self {
        self.default = Some(default);
        self
    }
}

impl Registry {
    /// Register an atom.
    ///
    /// An atom with a fallback default registers two nodes: the base atom
    /// under its own key, and a read-write selector `"{key}__withFallback"`
    /// which is what the returned handle points to.
    pub fn atom<T: StateValue>(&self, atom: Atom<T>) -> Result<Handle<T>, StateError> {
        let Atom { key, default } = atom;
        let default = match default {
            None => return self.register(Arc::new(AtomNode::new(key, Loadable::never(), false))),
            Some(AtomDefault::Value(value)) => Loadable::Resolved(Value::new(value)),
            Some(AtomDefault::Loadable(loadable)) => loadable.erase(),
            Some(AtomDefault::Fallback(fallback)) => return self.fallback_atom(key, fallback),
        };
        self.register(Arc::new(AtomNode::new(key, default, true)))
    }

    fn fallback_atom<T: StateValue>(&self, key: Key, fallback: Handle<T>) -> Result<Handle<T>, StateError> {
        // Both keys are checked up front so a rejected pair leaves nothing behind.
        let wrapper = Key::from(format!("{key}__withFallback"));
        if self.config().duplicate_keys == DuplicateKeyPolicy::Reject {
            if let Some(taken) = [&key, &wrapper].into_iter().find(|k| self.contains(k)) {
                return Err(StateError::DuplicateKey { key: taken.clone() });
            }
        }

        let base: Handle<T> = self.register(Arc::new(AtomNode::new(
            key.clone(),
            Loadable::Resolved(Value::unset()),
            false,
        )))?;

        let read_key = base.key().clone();
        let fallback_key = fallback.key().clone();
        let compute = compute_fn(move |get| {
            let value = get.read_value(&read_key)?;
            if value.is_unset() {
                Ok(Raw::Handle(fallback_key.clone()))
            } else {
                Ok(Raw::Value(value))
            }
        });

        let write_key = base.key().clone();
        let write = write_fn(move |setter, value| setter.write(&write_key, value));

        self.register(Arc::new(SelectorNode::new(
            wrapper,
            compute,
            Some(write),
        )))
    }
}

/// The registered form of an atom, with its value type erased.
pub(crate) struct AtomNode {
    key: Key,
    default: Arc<Mutex<Loadable<Value>>>,
    settles: bool,
}

impl AtomNode {
    fn new(key: Key, default: Loadable<Value>, settles: bool) -> Self {
        let slot = Arc::new(Mutex::new(default.clone()));

        // Once a pending default settles, reads see the outcome directly.
        if let Loadable::Pending(pending) = default {
            let target = Arc::clone(&slot);
            let tracked = Pending::new(async move {
                let outcome = pending.await;
                *target.lock() = match &outcome {
                    Ok(value) => Loadable::Resolved(value.clone()),
                    Err(failure) => Loadable::Failed(failure.clone()),
                };
                outcome
            });
            let mut current = slot.lock();
            if current.is_pending() {
                *current = Loadable::Pending(tracked);
            }
        }

        Self {
            key,
            default: slot,
            settles,
        }
    }

    fn default_loadable(&self) -> Loadable<Value> {
        self.default.lock().clone()
    }
}

impl Node for AtomNode {
    fn key(&self) -> &Key {
        &self.key
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Atom
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn init(&self, engine: &Engine) -> Teardown {
        if let (true, Loadable::Pending(pending)) = (self.settles, self.default_loadable()) {
            let engine = engine.downgrade();
            let key = self.key.clone();
            let spawned = spawn_detached(async move {
                let _ = pending.await;
                if let Some(engine) = engine.upgrade() {
                    if !engine.store().has_cache(&key) {
                        engine.mark_key_modified(&key);
                    }
                }
            });
            if !spawned {
                tracing::debug!(key = %self.key, "no runtime; pending default will not notify");
            }
        }
        Box::new(|| {})
    }

    fn get(&self, engine: &Engine) -> Loadable<Value> {
        engine
            .store()
            .get_cache(&self.key)
            .unwrap_or_else(|| self.default_loadable())
    }

    fn set(&self, engine: &Engine, value: NewValue<Value>) -> Result<NodeWrites, StateError> {
        let mut writes = NodeWrites::new();
        match (engine.store().get_cache(&self.key), &value) {
            (Some(Loadable::Resolved(current)), NewValue::Value(next)) if current == *next => {
                return Ok(writes);
            }
            (None, NewValue::Reset) => return Ok(writes),
            _ => {}
        }

        let written = match value {
            NewValue::Value(next) => next,
            NewValue::Reset => Value::unset(),
        };
        writes.insert(self.key.clone(), Loadable::Resolved(written));
        Ok(writes)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
