//! Dependency-tracking accessors handed to user code.
//!
//! A [`Getter`] is the context a selector computation runs in. Every read
//! through it is recorded as a dependency of the evaluation, together with
//! the value that was seen. Getters are clonable so a future returned by a
//! computation can keep reading after the synchronous part has finished.
//! Reads made after that point republish the dependency edges right away.
//!
//! A [`Setter`] is what a read-write selector's setter receives. Its writes
//! are not applied directly; they are merged into one map that the engine
//! applies as part of the surrounding action.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::engine::{Engine, WeakEngine};
use crate::error::{Failure, Interrupt, StateError};
use crate::execution::{DepLog, ExecutionId};
use crate::handle::{Handle, Key};
use crate::loadable::Loadable;
use crate::node::{NewValue, NodeWrites};
use crate::selector::SelectorCore;
use crate::value::{StateValue, Value};

/// Dependency accessor for selector computations.
#[derive(Clone)]
pub struct Getter {
    engine: WeakEngine,
    selector: Weak<SelectorCore>,
    execution: ExecutionId,
    deps: DepLog,
    synchronous: Arc<AtomicBool>,
}

impl Getter {
    pub(crate) fn new(engine: &Engine, selector: &Arc<SelectorCore>, execution: ExecutionId) -> Self {
        Self {
            engine: engine.downgrade(),
            selector: Arc::downgrade(selector),
            execution,
            deps: DepLog::default(),
            synchronous: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn deps(&self) -> &DepLog {
        &self.deps
    }

    /// The synchronous part of the computation has returned.
    pub(crate) fn end_sync(&self) {
        self.synchronous.store(false, Ordering::SeqCst);
    }

    /// Get the execution this getter reads for.
    pub fn execution(&self) -> ExecutionId {
        self.execution
    }

    /// Read a node and record it as a dependency.
    ///
    /// Once the engine is gone the read interrupts with a cancellation, which
    /// is not recorded.
    pub(crate) fn read(&self, key: &Key) -> Result<Loadable<Value>, Interrupt> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| Interrupt::Failed(Failure::canceled()))?;
        let loadable = match engine.get_node_loadable(key) {
            Ok(loadable) => loadable,
            Err(err) => Loadable::Failed(Failure::new(err)),
        };
        self.deps.record(key.clone(), loadable.clone());

        if !self.synchronous.load(Ordering::SeqCst) {
            if let Some(selector) = self.selector.upgrade() {
                tracing::trace!(selector = %selector.key(), dep = %key, "republishing dependencies");
                selector.update_deps(&engine, self.deps.keys());
            }
        }
        Ok(loadable)
    }

    pub(crate) fn read_value(&self, key: &Key) -> Result<Value, Interrupt> {
        match self.read(key)? {
            Loadable::Resolved(value) => Ok(value),
            Loadable::Pending(pending) => Err(Interrupt::Pending(pending)),
            Loadable::Failed(failure) => Err(Interrupt::Failed(failure)),
        }
    }

    /// The dependency's value. Pending and failed dependencies interrupt the
    /// computation through `?`.
    pub fn get<T: StateValue>(&self, handle: &Handle<T>) -> Result<T, Interrupt> {
        Ok(self.read_value(handle.key())?.cast::<T>()?)
    }

    /// The dependency's loadable, whatever its state. Never interrupts.
    ///
    /// After the engine is dropped this is a cancellation that the selector
    /// discards, whatever the computation does with it.
    pub fn get_loadable<T: StateValue>(&self, handle: &Handle<T>) -> Loadable<T> {
        match self.read(handle.key()) {
            Ok(loadable) => loadable.downcast(),
            Err(Interrupt::Pending(pending)) => Loadable::Pending(pending.downcast()),
            Err(Interrupt::Failed(failure)) => Loadable::Failed(failure),
        }
    }

    /// Wait for the dependency to resolve, for use inside returned futures.
    pub async fn wait<T: StateValue>(&self, handle: &Handle<T>) -> Result<T, Failure> {
        loop {
            let loadable = match self.read(handle.key()) {
                Ok(loadable) => loadable,
                Err(Interrupt::Pending(pending)) => Loadable::Pending(pending),
                Err(Interrupt::Failed(failure)) => return Err(failure),
            };
            match loadable {
                Loadable::Resolved(value) => return value.cast::<T>().map_err(Failure::new),
                Loadable::Failed(failure) => return Err(failure),
                Loadable::Pending(pending) => {
                    pending.await?;
                }
            }
        }
    }
}

/// Write accessor for read-write selectors.
pub struct Setter<'a> {
    engine: &'a Engine,
    writes: RefCell<NodeWrites>,
}

impl<'a> Setter<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self {
            engine,
            writes: RefCell::new(NodeWrites::new()),
        }
    }

    pub(crate) fn into_writes(self) -> NodeWrites {
        self.writes.into_inner()
    }

    /// Current value of a node. Fails if it is pending or failed.
    pub fn get<T: StateValue>(&self, handle: &Handle<T>) -> Result<T, StateError> {
        match self.engine.get_node_loadable(handle.key())? {
            Loadable::Resolved(value) => value.cast(),
            Loadable::Pending(_) => Err(StateError::Pending {
                key: handle.key().clone(),
            }),
            Loadable::Failed(failure) => Err(StateError::Failed(failure)),
        }
    }

    /// Write a value to a node.
    pub fn set<T: StateValue>(&self, handle: &Handle<T>, value: T) -> Result<(), StateError> {
        self.write(handle.key(), NewValue::Value(value).erase())
    }

    /// Write a value computed from the node's current one.
    pub fn update<T, F>(&self, handle: &Handle<T>, f: F) -> Result<(), StateError>
    where
        T: StateValue,
        F: FnOnce(T) -> T,
    {
        let current = self.get(handle)?;
        self.set(handle, f(current))
    }

    /// Return a node to its default.
    pub fn reset<T: StateValue>(&self, handle: &Handle<T>) -> Result<(), StateError> {
        self.write(handle.key(), NewValue::Reset)
    }

    pub(crate) fn write(&self, key: &Key, value: NewValue<Value>) -> Result<(), StateError> {
        let upstream = self.engine.set_node_value(key, value)?;
        self.writes.borrow_mut().extend(upstream);
        Ok(())
    }
}
