//! Batched writes.
//!
//! Writes made while a [`Transaction`] is open are queued and applied
//! together when the outermost transaction closes, so subscribers see one
//! notification per reached key no matter how many writes were made.
//!
//! ```rust,ignore
//! let tx = engine.transaction();
//! engine.set(&first, 1)?;
//! engine.set(&second, 2)?;
//! tx.commit()?; // one invalidation pass, one notification per key
//! ```
//!
//! Transactions nest. Dropping a transaction without calling
//! [`Transaction::commit`] also applies the queue; errors are then logged.

use crate::engine::{Action, Engine};
use crate::error::StateError;

#[derive(Default)]
pub(crate) struct BatchState {
    pub(crate) depth: usize,
    pub(crate) queued: Vec<Action>,
}

/// Scope guard for a batch of writes.
#[must_use = "writes are applied when the transaction is committed or dropped"]
pub struct Transaction {
    engine: Engine,
    closed: bool,
}

impl Transaction {
    /// Close the scope and return any error from applying the queue.
    pub fn commit(mut self) -> Result<(), StateError> {
        self.closed = true;
        self.engine.end_transaction()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.engine.end_transaction() {
            tracing::error!(error = %err, "transaction failed while closing its scope");
        }
    }
}

impl Engine {
    /// Open a transaction scope.
    pub fn transaction(&self) -> Transaction {
        self.batch_state().lock().depth += 1;
        Transaction {
            engine: self.clone(),
            closed: false,
        }
    }

    /// Run `f` inside a transaction and apply its writes when it returns.
    pub fn batch<R, F>(&self, f: F) -> Result<R, StateError>
    where
        F: FnOnce() -> R,
    {
        let tx = self.transaction();
        let out = f();
        tx.commit()?;
        Ok(out)
    }

    fn end_transaction(&self) -> Result<(), StateError> {
        let queued = {
            let mut batch = self.batch_state().lock();
            batch.depth = batch.depth.saturating_sub(1);
            if batch.depth > 0 {
                return Ok(());
            }
            std::mem::take(&mut batch.queued)
        };
        if queued.is_empty() {
            return Ok(());
        }
        self.apply_actions(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::registry::Registry;
    use crate::selector::Selector;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn batch_notifies_once() {
        let registry = Arc::new(Registry::new());
        let a = registry.atom(Atom::new("a").default(0)).unwrap();
        let b = registry.atom(Atom::new("b").default(0)).unwrap();
        let (ra, rb) = (a.clone(), b.clone());
        let sum = registry
            .selector(Selector::new("sum", move |get| Ok(get.get(&ra)? + get.get(&rb)?)))
            .unwrap();

        let engine = Engine::new(registry);
        assert_eq!(engine.get(&sum).unwrap().value(), Some(&0));

        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        engine.subscribe(&sum, move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        engine
            .batch(|| {
                engine.set(&a, 1).unwrap();
                engine.set(&b, 2).unwrap();
                // not applied yet
                assert_eq!(engine.get(&a).unwrap().value(), Some(&0));
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.get(&sum).unwrap().value(), Some(&3));
    }

    #[test]
    fn nested_transactions_apply_at_the_outermost() {
        let registry = Arc::new(Registry::new());
        let a = registry.atom(Atom::new("a").default(0)).unwrap();
        let engine = Engine::new(registry);

        let outer = engine.transaction();
        {
            let inner = engine.transaction();
            engine.set(&a, 1).unwrap();
            inner.commit().unwrap();
        }
        assert_eq!(engine.get(&a).unwrap().value(), Some(&0));

        drop(outer);
        assert_eq!(engine.get(&a).unwrap().value(), Some(&1));
    }

    #[test]
    fn failing_updater_stops_the_queue() {
        let registry = Arc::new(Registry::new());
        let a = registry.atom(Atom::new("a").default(0)).unwrap();
        let later = registry.atom(Atom::<i32>::new("later")).unwrap();
        let b = registry.atom(Atom::new("b").default(0)).unwrap();
        let engine = Engine::new(registry);

        let tx = engine.transaction();
        engine.set(&a, 1).unwrap();
        engine.update(&later, |v| v + 1).unwrap();
        engine.set(&b, 1).unwrap();
        let err = tx.commit().unwrap_err();

        assert!(matches!(err, StateError::PendingUpdate { .. }));
        assert_eq!(engine.get(&a).unwrap().value(), Some(&1));
        assert_eq!(engine.get(&b).unwrap().value(), Some(&0));
    }
}
