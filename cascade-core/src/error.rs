//! Error types.
//!
//! Two kinds of failure move through the crate, and they are kept apart on
//! purpose:
//!
//! - [`StateError`] is a programmer error: reading a key nobody registered,
//!   writing to a read-only node, applying an updater to a value that is still
//!   pending. These are returned at the call site and never cached.
//! - [`Failure`] is a user computation that failed. Failures are data: they sit
//!   inside [`Loadable::Failed`](crate::Loadable::Failed), get cached like any
//!   other result and flow through the value algebra.
//!
//! [`Interrupt`] is the control signal a computation propagates with `?` when
//! a dependency is pending or failed.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::handle::Key;
use crate::loadable::{LoadableState, Pending};
use crate::value::Value;

/// Programmer errors raised synchronously by the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    /// No node definition is registered under the key.
    #[error("missing definition for node \"{key}\"")]
    NodeMissing { key: Key },

    /// The node exposes no setter.
    #[error("attempt to set read-only node \"{key}\"")]
    ReadOnly { key: Key },

    /// An updater function was applied while the current value is pending.
    #[error(
        "tried to set \"{key}\" using an updater function while its current state is pending, \
         this is not currently supported"
    )]
    PendingUpdate { key: Key },

    /// A loadable accessor was called against the wrong state.
    #[error("loadable expected {expected}, but in \"{actual}\" state")]
    InvalidState {
        expected: LoadableState,
        actual: LoadableState,
    },

    /// The key is already registered and the registry rejects duplicates.
    #[error("duplicate node key \"{key}\"")]
    DuplicateKey { key: Key },

    /// A typed read found a value of another type.
    #[error("expected a value of type {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// A derived setter read a dependency that has not settled yet.
    #[error("dependency \"{key}\" is still pending")]
    Pending { key: Key },

    /// A family parameter could not be rendered into a key.
    #[error("invalid parameter for family \"{key}\": {message}")]
    Param { key: Key, message: String },

    /// A user failure re-raised by a write (e.g. an updater against a failed value).
    #[error(transparent)]
    Failed(Failure),
}

/// A failed user computation.
///
/// Cheap to clone. Two failures are equal only when they are the same failure
/// (identity), which is what lets the engine tell whether a dependency moved.
#[derive(Clone)]
pub struct Failure(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl Failure {
    /// Wrap an error. Wrapping a `Failure` returns it unchanged.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(failure) = (&error as &dyn Any).downcast_ref::<Failure>() {
            return failure.clone();
        }
        Self(Arc::new(error))
    }

    /// A failure carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    pub(crate) fn canceled() -> Self {
        Self::new(Canceled)
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.is::<Canceled>()
    }

    /// Borrow the inner error as `E`, if that is its type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if the inner error is an `E`.
    pub fn is<E>(&self) -> bool
    where
        E: std::error::Error + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns `true` if both failures are the same failure.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Failure {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Failure").field(&self.0).finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Every input of [`Loadable::any`](crate::Loadable::any) failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("all {} inputs failed", .failures.len())]
pub struct AggregateFailure {
    pub failures: Vec<Failure>,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

/// Raised by a continuation whose execution is no longer wanted.
///
/// Absorbed by the selector machinery; never cached, never notified.
#[derive(Debug, thiserror::Error)]
#[error("execution canceled")]
struct Canceled;

/// Why a dependency read did not produce a value.
///
/// Computations propagate this with `?`. Any `std::error::Error` converts into
/// [`Interrupt::Failed`], so user errors can be returned the same way.
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// The dependency is still loading; the computation re-runs once it settles.
    Pending(Pending<Value>),
    /// The dependency (or the computation itself) failed.
    Failed(Failure),
}

impl Interrupt {
    /// Shorthand for `Interrupt::Failed(Failure::msg(message))`.
    pub fn msg(message: impl Into<String>) -> Self {
        Interrupt::Failed(Failure::msg(message))
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Pending(pending) => write!(f, "waiting on pending value #{}", pending.id()),
            Interrupt::Failed(failure) => write!(f, "{}", failure),
        }
    }
}

impl<E> From<E> for Interrupt
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Interrupt::Failed(Failure::new(err))
    }
}
