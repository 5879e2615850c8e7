//! Selectors that combine several dependencies at once.
//!
//! Each combinator is a selector family keyed by the list of handles it
//! combines, so asking twice for the same list returns the same node. The
//! bodies only read every dependency's loadable and hand the list to one of
//! the [`Loadable`] operators.
//!
//! | dependencies          | `wait_for_none`      | `wait_for_any` | `wait_for_all` | `wait_for_all_settled` |
//! |-----------------------|----------------------|----------------|----------------|------------------------|
//! | pending, pending      | `[pending, pending]` | pending        | pending        | pending                |
//! | value, pending        | `[value, pending]`   | value          | pending        | pending                |
//! | value, value          | `[value, value]`     | value          | `[value, value]` | `[fulfilled, fulfilled]` |
//! | failed, pending       | `[failed, pending]`  | pending        | failed         | pending                |

use std::sync::Arc;

use crate::context::Getter;
use crate::error::StateError;
use crate::family::family_key;
use crate::handle::{Handle, Key};
use crate::loadable::{Loadable, Settled};
use crate::node::Node;
use crate::registry::Registry;
use crate::selector::{compute_fn, Raw, SelectorNode};
use crate::value::StateValue;

/// Register (or look up) the combinator `family` over `deps`.
fn combinator<D, T, F>(
    registry: &Registry,
    family: &str,
    deps: &[Handle<D>],
    combine: F,
) -> Result<Handle<T>, StateError>
where
    D: StateValue,
    T: StateValue,
    F: Fn(Vec<Loadable<D>>) -> Loadable<T> + Send + Sync + 'static,
{
    let key = family_key(&Key::from(family), deps)?;
    let deps = deps.to_vec();
    Ok(registry.get_or_register(key, move |key| -> Arc<dyn Node> {
        let compute = compute_fn(move |get: &Getter| {
            let loadables = deps.iter().map(|dep| get.get_loadable(dep)).collect();
            Ok(Raw::Loadable(combine(loadables).erase()))
        });
        Arc::new(SelectorNode::new(key, compute, None))
    }))
}

/// The dependency's loadable itself, always resolved.
///
/// Reading this never suspends or fails, whatever state the dependency is in.
pub fn no_wait<T: StateValue>(registry: &Registry, dep: &Handle<T>) -> Result<Handle<Loadable<T>>, StateError> {
    let key = family_key(&Key::from("__noWait"), dep)?;
    let dep = dep.clone();
    Ok(registry.get_or_register(key, move |key| -> Arc<dyn Node> {
        let compute = compute_fn(move |get: &Getter| {
            Ok(Raw::Loadable(Loadable::Resolved(get.get_loadable(&dep)).erase()))
        });
        Arc::new(SelectorNode::new(key, compute, None))
    }))
}

/// Every dependency's loadable, resolved right away.
pub fn wait_for_none<T: StateValue>(
    registry: &Registry,
    deps: &[Handle<T>],
) -> Result<Handle<Vec<Loadable<T>>>, StateError> {
    combinator(registry, "__waitForNone", deps, Loadable::Resolved)
}

/// All values, once every dependency has resolved. Fails with the first
/// failed dependency.
pub fn wait_for_all<T: StateValue>(registry: &Registry, deps: &[Handle<T>]) -> Result<Handle<Vec<T>>, StateError> {
    combinator(registry, "__waitForAll", deps, Loadable::all)
}

/// Every outcome, once no dependency is pending.
pub fn wait_for_all_settled<T: StateValue>(
    registry: &Registry,
    deps: &[Handle<T>],
) -> Result<Handle<Vec<Settled<T>>>, StateError> {
    combinator(registry, "__waitForAllSettled", deps, Loadable::all_settled)
}

/// The first dependency to resolve. Fails only when all of them have.
pub fn wait_for_any<T: StateValue>(registry: &Registry, deps: &[Handle<T>]) -> Result<Handle<T>, StateError> {
    combinator(registry, "__waitForAny", deps, Loadable::any)
}

/// The first dependency to settle, value or failure.
pub fn wait_for_race<T: StateValue>(registry: &Registry, deps: &[Handle<T>]) -> Result<Handle<T>, StateError> {
    combinator(registry, "__waitForRace", deps, Loadable::race)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::engine::Engine;
    use crate::error::Failure;
    use tokio::sync::oneshot;

    fn deferred(registry: &Registry, key: &str) -> (Handle<i32>, oneshot::Sender<Result<i32, Failure>>) {
        let (tx, rx) = oneshot::channel();
        let handle = registry
            .atom(Atom::new(key).default_future(async move {
                rx.await.unwrap_or_else(|_| Err(Failure::msg("dropped")))
            }))
            .unwrap();
        (handle, tx)
    }

    async fn flush() {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[test]
    fn same_list_same_node() {
        let registry = Arc::new(Registry::new());
        let a = registry.atom(Atom::new("a").default(1)).unwrap();
        let b = registry.atom(Atom::new("b").default(2)).unwrap();

        let first = wait_for_all(&registry, &[a.clone(), b.clone()]).unwrap();
        let second = wait_for_all(&registry, &[a.clone(), b.clone()]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.key().as_str(), r#"__waitForAll__[{"key":"a"},{"key":"b"}]"#);
        assert!(!first.is_writable());

        let reversed = wait_for_all(&registry, &[b, a]).unwrap();
        assert_ne!(first, reversed);
    }

    #[test]
    fn resolved_dependencies() {
        let registry = Arc::new(Registry::new());
        let a = registry.atom(Atom::new("a").default(1)).unwrap();
        let b = registry.atom(Atom::new("b").default(2)).unwrap();
        let deps = [a.clone(), b];
        let engine = Engine::new(registry.clone());

        let all = wait_for_all(&registry, &deps).unwrap();
        assert_eq!(engine.get(&all).unwrap().value(), Some(&vec![1, 2]));

        let any = wait_for_any(&registry, &deps).unwrap();
        assert_eq!(engine.get(&any).unwrap().value(), Some(&1));

        let none = wait_for_none(&registry, &deps).unwrap();
        let loadables = engine.get(&none).unwrap().value().cloned().unwrap();
        assert_eq!(loadables, vec![Loadable::Resolved(1), Loadable::Resolved(2)]);

        engine.set(&a, 5).unwrap();
        assert_eq!(engine.get(&all).unwrap().value(), Some(&vec![5, 2]));
    }

    #[test]
    fn no_wait_reflects_state_without_suspending() {
        let registry = Arc::new(Registry::new());
        let later = registry.atom(Atom::<i32>::new("later")).unwrap();
        let engine = Engine::new(registry.clone());

        let peek = no_wait(&registry, &later).unwrap();
        assert_eq!(peek.key().as_str(), r#"__noWait__{"key":"later"}"#);
        let outer = engine.get(&peek).unwrap();
        assert!(outer.is_resolved());
        assert!(outer.value().unwrap().is_pending());

        engine.set(&later, 4).unwrap();
        assert_eq!(engine.get(&peek).unwrap().value(), Some(&Loadable::Resolved(4)));
    }

    #[tokio::test]
    async fn pending_then_resolved() {
        let registry = Arc::new(Registry::new());
        let (a, resolve_a) = deferred(&registry, "a");
        let (b, resolve_b) = deferred(&registry, "b");
        let deps = [a, b];
        let engine = Engine::new(registry.clone());

        let none = wait_for_none(&registry, &deps).unwrap();
        let any = wait_for_any(&registry, &deps).unwrap();
        let all = wait_for_all(&registry, &deps).unwrap();
        let settled = wait_for_all_settled(&registry, &deps).unwrap();

        let loadables = engine.get(&none).unwrap().value().cloned().unwrap();
        assert!(loadables.iter().all(Loadable::is_pending));
        assert!(engine.get(&any).unwrap().is_pending());
        assert!(engine.get(&all).unwrap().is_pending());
        assert!(engine.get(&settled).unwrap().is_pending());

        resolve_a.send(Ok(0)).unwrap();
        flush().await;
        let loadables = engine.get(&none).unwrap().value().cloned().unwrap();
        assert_eq!(loadables[0], Loadable::Resolved(0));
        assert!(loadables[1].is_pending());
        assert_eq!(engine.get(&any).unwrap().value(), Some(&0));
        assert!(engine.get(&all).unwrap().is_pending());
        assert!(engine.get(&settled).unwrap().is_pending());

        resolve_b.send(Ok(1)).unwrap();
        flush().await;
        assert_eq!(engine.get(&all).unwrap().value(), Some(&vec![0, 1]));
        assert_eq!(
            engine.get(&settled).unwrap().value(),
            Some(&vec![Settled::Fulfilled(0), Settled::Fulfilled(1)])
        );
    }

    #[tokio::test]
    async fn failure_short_circuits_all_but_not_all_settled() {
        let registry = Arc::new(Registry::new());
        let failure = Failure::msg("boom");
        let broken = registry
            .atom(Atom::new("broken").default_loadable(Loadable::Failed(failure.clone())))
            .unwrap();
        let (slow, resolve) = deferred(&registry, "slow");
        let deps = [broken, slow];
        let engine = Engine::new(registry.clone());

        let all = wait_for_all(&registry, &deps).unwrap();
        let settled = wait_for_all_settled(&registry, &deps).unwrap();
        let race = wait_for_race(&registry, &deps).unwrap();

        assert_eq!(engine.get(&all).unwrap().error(), Some(&failure));
        assert_eq!(engine.get(&race).unwrap().error(), Some(&failure));
        assert!(engine.get(&settled).unwrap().is_pending());

        resolve.send(Ok(3)).unwrap();
        flush().await;
        assert_eq!(
            engine.get(&settled).unwrap().value(),
            Some(&vec![Settled::Rejected(failure), Settled::Fulfilled(3)])
        );
    }

    #[tokio::test]
    async fn any_fails_only_when_everything_has() {
        let registry = Arc::new(Registry::new());
        let (a, reject_a) = deferred(&registry, "a");
        let (b, reject_b) = deferred(&registry, "b");
        let engine = Engine::new(registry.clone());
        let any = wait_for_any(&registry, &[a, b]).unwrap();

        reject_a.send(Err(Failure::msg("first"))).unwrap();
        flush().await;
        assert!(engine.get(&any).unwrap().is_pending());

        reject_b.send(Err(Failure::msg("second"))).unwrap();
        flush().await;
        let loadable = engine.get(&any).unwrap();
        let aggregate = loadable.error().and_then(|failure| failure.downcast_ref::<crate::error::AggregateFailure>());
        assert_eq!(aggregate.map(|aggregate| aggregate.failures.len()), Some(2));
    }
}
