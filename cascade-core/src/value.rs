//! Type-erased node values.
//!
//! Nodes of every type live side by side in one registry and one store, so the
//! engine moves values around as [`Value`]: a shared, immutable, comparable
//! box. Typed handles downcast at the edge.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::error::StateError;

/// Bound for anything a node can hold.
///
/// Blanket-implemented; user types only need the derives.
pub trait StateValue: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T> StateValue for T where T: Clone + PartialEq + Debug + Send + Sync + 'static {}

trait Erased: Any + Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
    fn eq_erased(&self, other: &dyn Erased) -> bool;
    fn type_name(&self) -> &'static str;
}

impl<T: StateValue> Erased for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_erased(&self, other: &dyn Erased) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| self == other)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A shared, immutable value of any [`StateValue`] type.
///
/// Equality first compares identity, then falls back to the inner type's
/// `PartialEq`. Values of different types are never equal.
#[derive(Clone)]
pub struct Value(Arc<dyn Erased>);

/// Marker for "no value written": an atom reset, or a fallback base that
/// has never been set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Unset;

impl Value {
    /// Box a value. Boxing a `Value` returns it unchanged.
    pub fn new<T: StateValue>(value: T) -> Self {
        if let Some(value) = (&value as &dyn Any).downcast_ref::<Value>() {
            return value.clone();
        }
        Self(Arc::new(value))
    }

    pub(crate) fn unset() -> Self {
        Self::new(Unset)
    }

    pub(crate) fn is_unset(&self) -> bool {
        self.is::<Unset>()
    }

    /// Borrow the inner value as `T`.
    pub fn downcast_ref<T: StateValue>(&self) -> Option<&T> {
        if let Some(this) = (self as &dyn Any).downcast_ref::<T>() {
            return Some(this);
        }
        self.0.as_any().downcast_ref::<T>()
    }

    /// Clone the inner value out as `T`.
    pub fn downcast<T: StateValue>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// Like [`Value::downcast`], with a [`StateError::TypeMismatch`] on failure.
    pub fn cast<T: StateValue>(&self) -> Result<T, StateError> {
        self.downcast::<T>().ok_or_else(|| StateError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            found: self.type_name(),
        })
    }

    /// Whether the value holds a `T`.
    pub fn is<T: StateValue>(&self) -> bool {
        self.downcast_ref::<T>().is_some()
    }

    /// Name of the inner type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    /// Returns `true` if both values share one allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0.eq_erased(&*other.0)
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_recovers_the_value() {
        let value = Value::new(String::from("hello"));
        assert_eq!(value.downcast::<String>().as_deref(), Some("hello"));
        assert_eq!(value.downcast::<i32>(), None);
    }

    #[test]
    fn equality_by_content_and_type() {
        assert_eq!(Value::new(3_i32), Value::new(3_i32));
        assert_ne!(Value::new(3_i32), Value::new(4_i32));
        assert_ne!(Value::new(3_i32), Value::new(3_i64));
    }

    #[test]
    fn boxing_a_value_is_identity() {
        let inner = Value::new(vec![1, 2, 3]);
        let outer = Value::new(inner.clone());
        assert!(inner.ptr_eq(&outer));
        assert_eq!(outer.downcast::<Value>(), Some(inner));
    }

    #[test]
    fn unset_marker() {
        assert!(Value::unset().is_unset());
        assert!(!Value::new(()).is_unset());
    }
}
