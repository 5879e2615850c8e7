//! The node interface shared by atoms and selectors.

use indexmap::IndexMap;

use crate::engine::Engine;
use crate::error::StateError;
use crate::handle::Key;
use crate::loadable::Loadable;
use crate::store::Teardown;
use crate::value::{StateValue, Value};

/// Writes produced by a node's setter, keyed by the node they land on.
///
/// A reset is written as the unset marker; the engine turns it into a cache
/// deletion.
pub type NodeWrites = IndexMap<Key, Loadable<Value>>;

/// The kind of node in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Writable root holding a value or its default.
    Atom,
    /// Derived value computed from other nodes.
    Selector,
}

/// A value to write, or a request to return to the default.
#[derive(Debug, Clone, PartialEq)]
pub enum NewValue<T> {
    Value(T),
    Reset,
}

impl<T: StateValue> NewValue<T> {
    pub(crate) fn erase(self) -> NewValue<Value> {
        match self {
            NewValue::Value(value) => NewValue::Value(Value::new(value)),
            NewValue::Reset => NewValue::Reset,
        }
    }
}

impl NewValue<Value> {
    pub(crate) fn cast<T: StateValue>(self) -> Result<NewValue<T>, StateError> {
        match self {
            NewValue::Value(value) => Ok(NewValue::Value(value.cast()?)),
            NewValue::Reset => Ok(NewValue::Reset),
        }
    }
}

impl<T> From<T> for NewValue<T> {
    fn from(value: T) -> Self {
        NewValue::Value(value)
    }
}

/// Behavior of a registered node.
///
/// Nodes are definitions: one instance is shared by every store, and any
/// per-store state lives in the [`Store`](crate::Store) or is keyed by
/// [`StoreId`](crate::StoreId).
pub trait Node: Send + Sync {
    fn key(&self) -> &Key;

    fn kind(&self) -> NodeKind;

    fn is_writable(&self) -> bool {
        false
    }

    /// Called once per store, before the first read or write.
    fn init(&self, engine: &Engine) -> Teardown;

    fn get(&self, engine: &Engine) -> Loadable<Value>;

    /// Compute the writes for a new value. Nothing is applied here.
    fn set(&self, _engine: &Engine, _value: NewValue<Value>) -> Result<NodeWrites, StateError> {
        Err(StateError::ReadOnly {
            key: self.key().clone(),
        })
    }

    /// An upstream value changed within the current transaction.
    fn invalidate(&self, _engine: &Engine) {}

    /// Forget every cached result, transitively through discovered dependencies.
    fn clear_cache(&self, _engine: &Engine) {}
}
