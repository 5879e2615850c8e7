//! Parameterized nodes.
//!
//! A family builds one node per distinct parameter, on demand, and hands out
//! the same handle every time the same parameter comes back. The member key
//! is the family key followed by the parameter rendered as JSON:
//! `"todo__3"`, `"user__{\"id\":7}"`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::atom::{Atom, AtomDefault};
use crate::context::{Getter, Setter};
use crate::error::{Interrupt, StateError};
use crate::handle::{Handle, Key};
use crate::node::{NewValue, Node};
use crate::registry::Registry;
use crate::selector::{compute_fn, Computed, Raw, Selector, SelectorNode};
use crate::value::{StateValue, Value};

/// `"{family}__{json(param)}"`
pub(crate) fn family_key<P: Serialize + ?Sized>(family: &Key, param: &P) -> Result<Key, StateError> {
    serde_json::to_string(param)
        .map(|json| Key::from(format!("{family}__{json}")))
        .map_err(|err| StateError::Param {
            key: family.clone(),
            message: err.to_string(),
        })
}

type DefaultFn<T, P> = Arc<dyn Fn(&P) -> AtomDefault<T> + Send + Sync>;

/// Atoms keyed by a parameter.
///
/// ```rust,ignore
/// let todos = AtomFamily::new(&registry, "todo").with_default_fn(|id: &u32| {
///     AtomDefault::Value(format!("todo #{id}"))
/// });
/// let first = todos.get(&1)?;
/// ```
pub struct AtomFamily<T, P> {
    registry: Arc<Registry>,
    key: Key,
    default: Option<DefaultFn<T, P>>,
    members: Mutex<HashMap<Key, Handle<T>>>,
}

impl<T, P> AtomFamily<T, P>
where
    T: StateValue,
    P: Serialize,
{
    /// Members have no default and read as pending until written.
    pub fn new(registry: &Arc<Registry>, key: impl Into<Key>) -> Self {
        Self {
            registry: Arc::clone(registry),
            key: key.into(),
            default: None,
            members: Mutex::new(HashMap::new()),
        }
    }

    /// Every member starts from the same value.
    pub fn with_default(self, value: T) -> Self {
        self.with_default_fn(move |_| AtomDefault::Value(value.clone()))
    }

    /// Each member's default depends on its parameter.
    pub fn with_default_fn<F>(mut self, default: F) -> Self
    where
        F: Fn(&P) -> AtomDefault<T> + Send + Sync + 'static,
    {
        self.default = Some(Arc::new(default));
        self
    }

    /// Get the family's key prefix.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The member atom for `param`, registered on first use.
    pub fn get(&self, param: &P) -> Result<Handle<T>, StateError> {
        let key = family_key(&self.key, param)?;
        if let Some(handle) = self.members.lock().get(&key) {
            return Ok(handle.clone());
        }

        let atom = match &self.default {
            Some(default) => Atom::new(key.clone()).with(default(param)),
            None => Atom::new(key.clone()),
        };
        let handle = self.registry.atom(atom)?;
        self.members.lock().insert(key, handle.clone());
        Ok(handle)
    }
}

impl<T, P> fmt::Debug for AtomFamily<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomFamily")
            .field("key", &self.key)
            .field("members", &self.members.lock().len())
            .finish()
    }
}

type FamilyCompute<T, P> = Arc<dyn Fn(&P, &Getter) -> Result<Computed<T>, Interrupt> + Send + Sync>;
type FamilyWrite<T, P> =
    Arc<dyn for<'a> Fn(&P, &Setter<'a>, NewValue<T>) -> Result<(), StateError> + Send + Sync>;

/// Selectors keyed by a parameter.
pub struct SelectorFamily<T, P> {
    registry: Arc<Registry>,
    key: Key,
    compute: FamilyCompute<T, P>,
    write: Option<FamilyWrite<T, P>>,
    members: Mutex<HashMap<Key, Handle<T>>>,
}

impl<T, P> SelectorFamily<T, P>
where
    T: StateValue,
    P: Serialize + Clone + Send + Sync + 'static,
{
    /// Create a family of selectors computing plain values.
    pub fn new<F>(registry: &Arc<Registry>, key: impl Into<Key>, compute: F) -> Self
    where
        F: Fn(&P, &Getter) -> Result<T, Interrupt> + Send + Sync + 'static,
    {
        Self::computed(registry, key, move |param, get| compute(param, get).map(Computed::Value))
    }

    /// Create a family of selectors returning a [`Computed`].
    pub fn computed<F>(registry: &Arc<Registry>, key: impl Into<Key>, compute: F) -> Self
    where
        F: Fn(&P, &Getter) -> Result<Computed<T>, Interrupt> + Send + Sync + 'static,
    {
        Self {
            registry: Arc::clone(registry),
            key: key.into(),
            compute: Arc::new(compute),
            write: None,
            members: Mutex::new(HashMap::new()),
        }
    }

    /// Make every member writable.
    pub fn with_set<F>(mut self, set: F) -> Self
    where
        F: for<'a> Fn(&P, &Setter<'a>, NewValue<T>) -> Result<(), StateError> + Send + Sync + 'static,
    {
        self.write = Some(Arc::new(set));
        self
    }

    /// Get the family's key prefix.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The member selector for `param`, registered on first use.
    pub fn get(&self, param: &P) -> Result<Handle<T>, StateError> {
        let key = family_key(&self.key, param)?;
        if let Some(handle) = self.members.lock().get(&key) {
            return Ok(handle.clone());
        }

        let compute = Arc::clone(&self.compute);
        let read_param = param.clone();
        let mut selector =
            Selector::computed(key.clone(), move |get| compute(&read_param, get));
        if let Some(write) = &self.write {
            let write = Arc::clone(write);
            let write_param = param.clone();
            selector = selector.with_set(move |setter, value| write(&write_param, setter, value));
        }

        let handle = self.registry.selector(selector)?;
        self.members.lock().insert(key, handle.clone());
        Ok(handle)
    }
}

impl<T, P> fmt::Debug for SelectorFamily<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorFamily")
            .field("key", &self.key)
            .field("writable", &self.write.is_some())
            .field("members", &self.members.lock().len())
            .finish()
    }
}

/// A read-only node that always holds `value`.
pub fn const_selector<T>(registry: &Registry, value: T) -> Result<Handle<T>, StateError>
where
    T: StateValue + Serialize,
{
    let key = family_key(&Key::from("__constant"), &value)?;
    let value = Value::new(value);
    Ok(registry.get_or_register(key, move |key| -> Arc<dyn Node> {
        Arc::new(SelectorNode::new(
            key,
            compute_fn(move |_| Ok(Raw::Value(value.clone()))),
            None,
        ))
    }))
}

/// A read-only node that always fails with `message`.
pub fn error_selector<T: StateValue>(registry: &Registry, message: &str) -> Result<Handle<T>, StateError> {
    let key = family_key(&Key::from("__error"), message)?;
    let message = message.to_owned();
    Ok(registry.get_or_register(key, move |key| -> Arc<dyn Node> {
        Arc::new(SelectorNode::new(
            key,
            compute_fn(move |_| Err(Interrupt::msg(message.clone()))),
            None,
        ))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[derive(Serialize, Clone)]
    struct Query {
        user: u32,
        page: u32,
    }

    #[test]
    fn family_keys_embed_json() {
        let key = family_key(&Key::from("user"), &Query { user: 7, page: 1 }).unwrap();
        assert_eq!(key.as_str(), r#"user__{"user":7,"page":1}"#);
    }

    #[test]
    fn same_param_same_atom() {
        let registry = Arc::new(Registry::new());
        let todos = AtomFamily::new(&registry, "todo")
            .with_default_fn(|id: &u32| AtomDefault::Value(format!("todo #{id}")));

        let first = todos.get(&1).unwrap();
        assert_eq!(first, todos.get(&1).unwrap());
        assert_ne!(first, todos.get(&2).unwrap());
        assert_eq!(registry.len(), 2);

        let engine = Engine::new(registry);
        assert_eq!(engine.get(&first).unwrap().value().map(String::as_str), Some("todo #1"));
    }

    #[test]
    fn selector_family_reads_its_param() {
        let registry = Arc::new(Registry::new());
        let base = registry.atom(Atom::new("base").default(10)).unwrap();
        let plus = SelectorFamily::new(&registry, "plus", move |n: &i32, get| Ok(get.get(&base)? + n));

        let engine = Engine::new(registry);
        let plus_five = plus.get(&5).unwrap();
        assert_eq!(plus_five.key().as_str(), "plus__5");
        assert_eq!(engine.get(&plus_five).unwrap().value(), Some(&15));
    }

    #[test]
    fn constants_and_errors() {
        let registry = Arc::new(Registry::new());
        let answer = const_selector(&registry, 42_u32).unwrap();
        assert_eq!(answer, const_selector(&registry, 42_u32).unwrap());
        assert_eq!(answer.key().as_str(), "__constant__42");

        let broken: Handle<u32> = error_selector(&registry, "offline").unwrap();
        assert_eq!(broken.key().as_str(), r#"__error__"offline""#);

        let engine = Engine::new(registry);
        assert_eq!(engine.get(&answer).unwrap().value(), Some(&42));
        let failure = engine.get(&broken).unwrap();
        assert_eq!(failure.error().map(ToString::to_string).as_deref(), Some("offline"));
    }
}
