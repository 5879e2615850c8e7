//! Cascade Core
//!
//! Dependency-tracked application state. State lives in named nodes:
//!
//! - atoms, which hold values written from outside
//! - selectors, which derive values from other nodes and discover their
//!   dependencies by watching what they read
//!
//! Every read produces a [`Loadable`]: resolved, pending or failed. Async
//! computations compose with sync ones through it, and failures are data
//! rather than panics.
//!
//! # Architecture
//!
//! - [`Registry`]: node definitions, keyed by name. Shared by any number of
//!   engines.
//! - [`Store`]: one session's mutable state. Cached results, dependency
//!   edges in both directions, dirty keys and subscribers.
//! - [`Engine`]: a registry and a store together. Reads and writes go
//!   through it, including batched writes ([`Engine::batch`]) and change
//!   notification.
//! - [`combinators`]: selectors that wait on several dependencies at once.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cascade_core::{Atom, Engine, Registry, Selector};
//!
//! let registry = Arc::new(Registry::new());
//! let count = registry.atom(Atom::new("count").default(1))?;
//! let c = count.clone();
//! let doubled = registry.selector(Selector::new("doubled", move |get| Ok(get.get(&c)? * 2)))?;
//!
//! let engine = Engine::new(registry);
//! engine.subscribe(&doubled, || println!("doubled changed"));
//!
//! engine.set(&count, 5)?;
//! // prints "doubled changed"
//! assert_eq!(engine.get(&doubled)?.value(), Some(&10));
//! ```

mod atom;
mod context;
mod engine;
mod error;
mod execution;
mod family;
mod handle;
mod loadable;
mod node;
mod registry;
mod selector;
mod store;
mod subscriber;
mod transaction;
mod value;

pub mod combinators;

pub use atom::{Atom, AtomDefault};
pub use context::{Getter, Setter};
pub use engine::Engine;
pub use error::{AggregateFailure, Failure, Interrupt, StateError};
pub use execution::ExecutionId;
pub use family::{const_selector, error_selector, AtomFamily, SelectorFamily};
pub use handle::{Access, Handle, Key};
pub use loadable::{Loadable, LoadableState, Pending, Settled, SettledStatus};
pub use node::{NewValue, Node, NodeKind, NodeWrites};
pub use registry::{DuplicateKeyPolicy, Registry, RegistryConfig};
pub use selector::{Computed, Selector};
pub use store::{Store, StoreId, Teardown};
pub use subscriber::{Subscriber, SubscriberId};
pub use transaction::Transaction;
pub use value::{StateValue, Value};
