//! Execution records for async selectors.
//!
//! Each evaluation of a selector gets an [`ExecutionId`] from a process-wide
//! counter, so later executions always have larger ids. While an evaluation
//! is pending, the selector keeps one [`ExecutionRecord`] per store: the id,
//! the pending result and the dependency values the evaluation saw.
//!
//! Only the latest execution of a store may write its result back. One that
//! settles after a newer execution started, or after its record was dropped,
//! is stale and its result is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use crate::handle::Key;
use crate::loadable::{Loadable, Pending};
use crate::store::StoreId;
use crate::value::Value;

/// Generation number of one selector evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(u64);

impl ExecutionId {
    /// Allocate the next execution ID.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Dependency values seen by an evaluation, in read order.
pub(crate) type DepValues = IndexMap<Key, Loadable<Value>>;

/// Shared log of dependency reads, appended to by the getter for as long as
/// the evaluation (or its continuation) keeps reading.
#[derive(Clone, Default)]
pub(crate) struct DepLog(Arc<Mutex<DepValues>>);

impl DepLog {
    pub(crate) fn record(&self, key: Key, loadable: Loadable<Value>) {
        self.0.lock().insert(key, loadable);
    }

    pub(crate) fn snapshot(&self) -> DepValues {
        self.0.lock().clone()
    }

    pub(crate) fn keys(&self) -> IndexSet<Key> {
        self.0.lock().keys().cloned().collect()
    }
}

#[derive(Clone)]
pub(crate) struct ExecutionRecord {
    pub(crate) id: ExecutionId,
    pub(crate) pending: Pending<Value>,
    pub(crate) deps: DepLog,
}

/// How a settling execution relates to the store's current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settle {
    /// It was the latest execution; its record has been cleared.
    Current,
    /// Its record was dropped (cache hit, cache clear or teardown).
    Orphaned,
    /// A newer execution has started since.
    Superseded,
}

/// The in-flight execution of one selector, per store.
#[derive(Default)]
pub(crate) struct Executions {
    records: Mutex<HashMap<StoreId, ExecutionRecord>>,
}

impl Executions {
    pub(crate) fn current(&self, store: StoreId) -> Option<ExecutionRecord> {
        self.records.lock().get(&store).cloned()
    }

    pub(crate) fn is_latest(&self, store: StoreId, id: ExecutionId) -> bool {
        self.records
            .lock()
            .get(&store)
            .map_or(false, |record| record.id == id)
    }

    pub(crate) fn begin(&self, store: StoreId, id: ExecutionId, pending: Pending<Value>, deps: DepLog) {
        self.records
            .lock()
            .insert(store, ExecutionRecord { id, pending, deps });
    }

    /// Point the record at a new dependency log, if `id` is still latest.
    pub(crate) fn refresh_deps(&self, store: StoreId, id: ExecutionId, deps: DepLog) {
        if let Some(record) = self.records.lock().get_mut(&store) {
            if record.id == id {
                record.deps = deps;
            }
        }
    }

    pub(crate) fn settle(&self, store: StoreId, id: ExecutionId) -> Settle {
        let mut records = self.records.lock();
        match records.get(&store) {
            Some(record) if record.id == id => {
                records.remove(&store);
                Settle::Current
            }
            Some(_) => Settle::Superseded,
            None => Settle::Orphaned,
        }
    }

    pub(crate) fn clear(&self, store: StoreId) {
        self.records.lock().remove(&store);
    }
}
