//! Selectors: derived nodes.
//!
//! A selector is a computation over other nodes. It reads its dependencies
//! through a [`Getter`], which records what was read, and the engine uses
//! those edges to invalidate the selector when any dependency changes.
//!
//! # How Evaluation Works
//!
//! 1. A read first looks for a cached result: the store cache, then the
//!    selector's local cache (one slot per store), which is only trusted if
//!    every dependency it remembers still has the same value.
//!
//! 2. With no cache, an in-flight execution for this store is reused as long
//!    as every dependency it has seen so far still matches.
//!
//! 3. Otherwise the computation runs under a fresh [`ExecutionId`]:
//!    - a plain value or failure is cached right away
//!    - a future becomes a pending result; when it settles, the result goes
//!      to the local cache and the selector is marked modified
//!    - a pending dependency interrupts the computation; it is re-run once
//!      that dependency settles
//!
//! # Supersession
//!
//! A dependency can change while an execution is still in flight. The next
//! read then starts a newer execution, and the older one can no longer write
//! its result back when it settles. Continuations also stand down (with an
//! internal cancellation that is never cached) once the store is gone.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use indexmap::IndexSet;
use parking_lot::Mutex;

use crate::context::{Getter, Setter};
use crate::engine::{Engine, WeakEngine};
use crate::error::{Failure, Interrupt, StateError};
use crate::execution::{DepLog, DepValues, ExecutionId, Executions, Settle};
use crate::handle::{Handle, Key};
use crate::loadable::{Loadable, Pending};
use crate::node::{NewValue, Node, NodeKind, NodeWrites};
use crate::registry::Registry;
use crate::store::{StoreId, Teardown};
use crate::value::{StateValue, Value};

/// What a selector computation may return besides a plain value.
pub enum Computed<T> {
    Value(T),
    Loadable(Loadable<T>),
    Future(BoxFuture<'static, Result<T, Failure>>),
    /// Read through to another node.
    Handle(Handle<T>),
}

impl<T: StateValue> Computed<T> {
    /// Resolve to the outcome of `future`.
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        Computed::Future(future.boxed())
    }

    fn erase(self) -> Raw {
        match self {
            Computed::Value(value) => Raw::Value(Value::new(value)),
            Computed::Loadable(loadable) => Raw::Loadable(loadable.erase()),
            Computed::Future(future) => {
                Raw::Loadable(Loadable::Pending(Pending::new(future.map(|outcome| outcome.map(Value::new)))))
            }
            Computed::Handle(handle) => Raw::Handle(handle.key().clone()),
        }
    }
}

impl<T> From<Loadable<T>> for Computed<T> {
    fn from(loadable: Loadable<T>) -> Self {
        Computed::Loadable(loadable)
    }
}

impl<T> From<Handle<T>> for Computed<T> {
    fn from(handle: Handle<T>) -> Self {
        Computed::Handle(handle)
    }
}

/// Type-erased computation result.
pub(crate) enum Raw {
    Value(Value),
    Loadable(Loadable<Value>),
    Handle(Key),
}

pub(crate) type Compute = Arc<dyn Fn(&Getter) -> Result<Raw, Interrupt> + Send + Sync>;
pub(crate) type Write =
    Arc<dyn for<'a> Fn(&Setter<'a>, NewValue<Value>) -> Result<(), StateError> + Send + Sync>;

pub(crate) fn compute_fn<F>(f: F) -> Compute
where
    F: Fn(&Getter) -> Result<Raw, Interrupt> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) fn write_fn<F>(f: F) -> Write
where
    F: for<'a> Fn(&Setter<'a>, NewValue<Value>) -> Result<(), StateError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Selector definition, registered with [`Registry::selector`].
///
/// ```rust,ignore
/// let total = registry.selector(Selector::new("total", move |get| {
///     Ok(get.get(&price)? * get.get(&quantity)?)
/// }))?;
/// ```
pub struct Selector<T> {
    key: Key,
    compute: Compute,
    write: Option<Write>,
    marker: PhantomData<fn() -> T>,
}

impl<T: StateValue> Selector<T> {
    /// A selector computing a plain value.
    pub fn new<F>(key: impl Into<Key>, compute: F) -> Self
    where
        F: Fn(&Getter) -> Result<T, Interrupt> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            compute: compute_fn(move |get| compute(get).map(|value| Raw::Value(Value::new(value)))),
            write: None,
            marker: PhantomData,
        }
    }

    /// A selector that may return a loadable, a future or another handle.
    pub fn computed<F>(key: impl Into<Key>, compute: F) -> Self
    where
        F: Fn(&Getter) -> Result<Computed<T>, Interrupt> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            compute: compute_fn(move |get| compute(get).map(Computed::erase)),
            write: None,
            marker: PhantomData,
        }
    }

    /// Make the selector writable.
    pub fn with_set<F>(mut self, set: F) -> Self
    where
        F: for<'a> Fn(&Setter<'a>, NewValue<T>) -> Result<(), StateError> + Send + Sync + 'static,
    {
        self.write = Some(write_fn(move |setter, value| set(setter, value.cast::<T>()?)));
        self
    }
}

impl Registry {
    /// Register a selector.
    pub fn selector<T: StateValue>(&self, selector: Selector<T>) -> Result<Handle<T>, StateError> {
        let Selector {
            key,
            compute,
            write,
            ..
        } = selector;
        self.register(Arc::new(SelectorNode::new(key, compute, write)))
    }
}

struct LocalCache {
    deps: DepValues,
    loadable: Loadable<Value>,
}

/// Shared selector state. Continuations and getters hold on to it.
pub(crate) struct SelectorCore {
    key: Key,
    compute: Compute,
    write: Option<Write>,
    executions: Executions,
    /// Every key this selector has read in each store, for transitive cache
    /// clearing.
    discovered: Mutex<HashMap<StoreId, IndexSet<Key>>>,
    /// Last async result per store, with the dependency values it saw.
    local: Mutex<HashMap<StoreId, LocalCache>>,
    live_stores: AtomicUsize,
}

/// The registered form of a selector, with its value type erased.
pub(crate) struct SelectorNode {
    core: Arc<SelectorCore>,
}

impl SelectorNode {
    pub(crate) fn new(key: Key, compute: Compute, write: Option<Write>) -> Self {
        Self {
            core: Arc::new(SelectorCore {
                key,
                compute,
                write,
                executions: Executions::default(),
                discovered: Mutex::new(HashMap::new()),
                local: Mutex::new(HashMap::new()),
                live_stores: AtomicUsize::new(0),
            }),
        }
    }
}

impl SelectorCore {
    pub(crate) fn key(&self) -> &Key {
        &self.key
    }

    fn is_live(&self) -> bool {
        self.live_stores.load(Ordering::SeqCst) > 0
    }

    /// Publish the dependency edges of the latest evaluation.
    pub(crate) fn update_deps(&self, engine: &Engine, keys: IndexSet<Key>) {
        self.discovered
            .lock()
            .entry(engine.id())
            .or_default()
            .extend(keys.iter().cloned());
        engine.store().set_dep_keys(&self.key, keys);
    }

    fn deps_unchanged(engine: &Engine, deps: DepValues) -> bool {
        deps.into_iter().all(|(key, seen)| {
            engine
                .get_node_loadable(&key)
                .map_or(false, |now| now == seen)
        })
    }

    fn cached(&self, engine: &Engine) -> Option<Loadable<Value>> {
        if let Some(loadable) = engine.store().get_cache(&self.key) {
            return Some(loadable);
        }

        let (deps, loadable) = {
            let local = self.local.lock();
            let local = local.get(&engine.id())?;
            (local.deps.clone(), local.loadable.clone())
        };
        if !Self::deps_unchanged(engine, deps) {
            return None;
        }
        engine.store().set_cache(self.key.clone(), loadable.clone());
        Some(loadable)
    }

    /// The in-flight execution for this store, if its dependencies still hold.
    fn in_progress(&self, engine: &Engine) -> Option<Pending<Value>> {
        let record = self.executions.current(engine.id())?;
        if Self::deps_unchanged(engine, record.deps.snapshot()) {
            Some(record.pending)
        } else {
            None
        }
    }

    fn get(self: &Arc<Self>, engine: &Engine) -> Loadable<Value> {
        if let Some(loadable) = self.cached(engine) {
            self.executions.clear(engine.id());
            return loadable;
        }

        if let Some(pending) = self.in_progress(engine) {
            return Loadable::Pending(pending);
        }

        let id = ExecutionId::next();
        let (loadable, deps) = self.evaluate(engine, id);
        match &loadable {
            Loadable::Pending(pending) => {
                self.executions.begin(engine.id(), id, pending.clone(), deps);
            }
            settled => {
                self.executions.clear(engine.id());
                engine.store().set_cache(self.key.clone(), settled.clone());
            }
        }
        loadable
    }

    /// Run the computation once under `id`.
    fn evaluate(self: &Arc<Self>, engine: &Engine, id: ExecutionId) -> (Loadable<Value>, DepLog) {
        let getter = Getter::new(engine, self, id);
        let deps = getter.deps().clone();

        let loadable = match (self.compute)(&getter) {
            Ok(Raw::Value(value)) => Loadable::Resolved(value),
            Ok(Raw::Loadable(Loadable::Pending(pending))) => {
                Loadable::Pending(self.wrap_result(engine, pending, deps.clone(), id))
            }
            Ok(Raw::Loadable(settled)) => settled,
            Ok(Raw::Handle(key)) => match getter.read_value(&key) {
                Ok(value) => Loadable::Resolved(value),
                Err(interrupt) => self.interrupted(engine, interrupt, &deps, id),
            },
            Err(interrupt) => self.interrupted(engine, interrupt, &deps, id),
        };

        getter.end_sync();
        self.executions.refresh_deps(engine.id(), id, deps.clone());
        self.update_deps(engine, deps.keys());
        (loadable, deps)
    }

    fn interrupted(
        self: &Arc<Self>,
        engine: &Engine,
        interrupt: Interrupt,
        deps: &DepLog,
        id: ExecutionId,
    ) -> Loadable<Value> {
        match interrupt {
            Interrupt::Pending(dependency) => {
                Loadable::Pending(self.wrap_dependency(engine, dependency, deps.clone(), id))
            }
            Interrupt::Failed(failure) => Loadable::Failed(failure),
        }
    }

    /// The engine behind `weak`, if it is alive and this selector is still
    /// live in it.
    fn live_engine(&self, weak: &WeakEngine, store: StoreId) -> Option<Engine> {
        match weak.upgrade() {
            Some(engine) if self.is_live() => Some(engine),
            _ => {
                self.executions.clear(store);
                tracing::debug!(key = %self.key, store = store.raw(), "store gone, execution canceled");
                None
            }
        }
    }

    /// The computation returned a future: cache its outcome once it settles.
    fn wrap_result(
        self: &Arc<Self>,
        engine: &Engine,
        result: Pending<Value>,
        deps: DepLog,
        id: ExecutionId,
    ) -> Pending<Value> {
        let core = Arc::clone(self);
        let weak = engine.downgrade();
        let store = engine.id();

        Pending::new(async move {
            let outcome = result.await;
            if matches!(&outcome, Err(failure) if failure.is_canceled()) {
                return outcome;
            }
            let Some(engine) = core.live_engine(&weak, store) else {
                return Err(Failure::canceled());
            };
            let settled = match &outcome {
                Ok(value) => Loadable::Resolved(value.clone()),
                Err(failure) => Loadable::Failed(failure.clone()),
            };
            core.resolve_async(&engine, settled, deps.snapshot(), id);
            outcome
        })
    }

    /// A dependency was pending: re-run the computation once it settles.
    fn wrap_dependency(
        self: &Arc<Self>,
        engine: &Engine,
        dependency: Pending<Value>,
        deps: DepLog,
        id: ExecutionId,
    ) -> Pending<Value> {
        let core = Arc::clone(self);
        let weak = engine.downgrade();
        let store = engine.id();

        Pending::new(async move {
            let next = match dependency.await {
                Err(failure) if failure.is_canceled() => return Err(failure),
                Err(failure) => {
                    let Some(engine) = core.live_engine(&weak, store) else {
                        return Err(Failure::canceled());
                    };
                    core.resolve_async(&engine, Loadable::Failed(failure.clone()), deps.snapshot(), id);
                    return Err(failure);
                }
                Ok(_) => {
                    let Some(engine) = core.live_engine(&weak, store) else {
                        return Err(Failure::canceled());
                    };
                    let newer = if core.executions.is_latest(store, id) {
                        None
                    } else {
                        core.in_progress(&engine)
                    };
                    match newer {
                        Some(pending) => Loadable::Pending(pending),
                        None => core.reevaluate(&engine, id),
                    }
                }
            };
            // no strong engine reference past this point
            next.await
        })
    }

    fn reevaluate(self: &Arc<Self>, engine: &Engine, id: ExecutionId) -> Loadable<Value> {
        let (loadable, deps) = self.evaluate(engine, id);
        if !loadable.is_pending() {
            self.resolve_async(engine, loadable.clone(), deps.snapshot(), id);
        }
        loadable
    }

    /// Record an async outcome and tell dependents about it.
    fn resolve_async(&self, engine: &Engine, loadable: Loadable<Value>, deps: DepValues, id: ExecutionId) {
        let settle = self.executions.settle(engine.id(), id);
        if settle != Settle::Current {
            tracing::debug!(key = %self.key, ?id, ?settle, "stale execution settled, result discarded");
            return;
        }
        self.local.lock().insert(engine.id(), LocalCache { deps, loadable });
        engine.mark_key_modified(&self.key);
    }

    fn clear_cache(&self, engine: &Engine) {
        let discovered = self.discovered.lock().remove(&engine.id()).unwrap_or_default();
        for key in &discovered {
            if let Some(node) = engine.registry().node_maybe(key) {
                node.clear_cache(engine);
            }
        }
        engine.store().del_cache(&self.key);
        self.local.lock().remove(&engine.id());
        self.executions.clear(engine.id());
        engine.mark_key_modified(&self.key);
    }
}

impl Node for SelectorNode {
    fn key(&self) -> &Key {
        &self.core.key
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Selector
    }

    fn is_writable(&self) -> bool {
        self.core.write.is_some()
    }

    fn init(&self, engine: &Engine) -> Teardown {
        self.core.live_stores.fetch_add(1, Ordering::SeqCst);
        let core = Arc::clone(&self.core);
        let store = engine.id();
        Box::new(move || {
            core.live_stores.fetch_sub(1, Ordering::SeqCst);
            core.executions.clear(store);
            core.local.lock().remove(&store);
            core.discovered.lock().remove(&store);
        })
    }

    fn get(&self, engine: &Engine) -> Loadable<Value> {
        self.core.get(engine)
    }

    fn set(&self, engine: &Engine, value: NewValue<Value>) -> Result<NodeWrites, StateError> {
        let write = self.core.write.as_ref().ok_or_else(|| StateError::ReadOnly {
            key: self.core.key.clone(),
        })?;
        let setter = Setter::new(engine);
        write(&setter, value)?;
        Ok(setter.into_writes())
    }

    fn invalidate(&self, engine: &Engine) {
        if engine.store().del_cache(&self.core.key) {
            engine.store().dirty(self.core.key.clone());
        }
    }

    fn clear_cache(&self, engine: &Engine) {
        self.core.clear_cache(engine);
    }
}

impl fmt::Debug for SelectorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorNode")
            .field("key", &self.core.key)
            .field("writable", &self.core.write.is_some())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
