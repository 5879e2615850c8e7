//! Loadable: a value that is resolved, pending or failed.
//!
//! Every node read produces a [`Loadable`]. The three states are exclusive and
//! carry their payload directly:
//!
//! - `Resolved(T)`: the value is available now.
//! - `Pending(Pending<T>)`: a shared future that will settle to a value or a
//!   failure. Cloning a `Pending` shares the future and its identity.
//! - `Failed(Failure)`: the computation failed.
//!
//! # Eager futures
//!
//! A [`Pending`] created inside a tokio runtime is driven to completion by a
//! detached task, whether or not anyone awaits it. That keeps continuations
//! (such as a selector caching its async result) running even when every
//! reader has gone away. Outside a runtime the future settles when awaited.
//!
//! # Combining
//!
//! [`Loadable::all`], [`Loadable::all_settled`], [`Loadable::race`] and
//! [`Loadable::any`] combine lists of loadables. Each scans its inputs
//! synchronously first and only builds a future when the answer is not known
//! yet.

use std::any::Any;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::error::{AggregateFailure, Failure, Interrupt, StateError};
use crate::value::{StateValue, Value};

/// Counter for pending identities.
static PENDING_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_pending_id() -> u64 {
    PENDING_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Run a future to completion on the ambient tokio runtime, if there is one.
///
/// Returns `false` when no runtime is available and the future was dropped.
pub(crate) fn spawn_detached<F>(task: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(task);
            true
        }
        Err(_) => false,
    }
}

/// Which of the three states a loadable is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadableState {
    HasValue,
    Loading,
    HasError,
}

impl fmt::Display for LoadableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadableState::HasValue => "hasValue",
            LoadableState::Loading => "loading",
            LoadableState::HasError => "hasError",
        })
    }
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, Failure>>>;

/// A shared, identity-carrying future of a `Result<T, Failure>`.
///
/// Two `Pending`s are equal only if one is a clone of the other.
pub struct Pending<T> {
    id: u64,
    future: SharedResult<T>,
}

impl<T: StateValue> Pending<T> {
    /// Wrap a future. Inside a tokio runtime the future starts running now.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        let future = future.boxed().shared();
        spawn_detached(future.clone().map(|_| ()));
        Self {
            id: next_pending_id(),
            future,
        }
    }

    /// A pending that never settles.
    pub fn never() -> Self {
        Self {
            id: next_pending_id(),
            future: future::pending().boxed().shared(),
        }
    }

    /// Get the pending's identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The outcome, if the future has already settled.
    ///
    /// Re-typed views are polled once here, so they report a source that
    /// settled while nobody was watching them.
    pub fn peek(&self) -> Option<Result<T, Failure>> {
        self.future
            .peek()
            .cloned()
            .or_else(|| self.future.clone().now_or_never())
    }

    /// Erase the payload type. The erased pending keeps this one's identity.
    pub fn erase(&self) -> Pending<Value> {
        if let Some(erased) = (self as &dyn Any).downcast_ref::<Pending<Value>>() {
            return erased.clone();
        }
        Pending::view(self.id, self.future.clone().map(|outcome| outcome.map(Value::new)))
    }
}

impl<T> Pending<T> {
    /// Re-typed view of an existing pending. The source already has a
    /// driver, so nothing is spawned here.
    fn view<F>(id: u64, future: F) -> Self
    where
        F: Future<Output = Result<T, Failure>> + Send + 'static,
        T: Clone + Send + Sync + 'static,
    {
        Self {
            id,
            future: future.boxed().shared(),
        }
    }
}

impl Pending<Value> {
    /// Recover the payload type, keeping the identity. A value of another
    /// type settles as a [`StateError::TypeMismatch`] failure.
    pub fn downcast<T: StateValue>(&self) -> Pending<T> {
        if let Some(typed) = (self as &dyn Any).downcast_ref::<Pending<T>>() {
            return typed.clone();
        }
        let future = self
            .future
            .clone()
            .map(|outcome| outcome.and_then(|value| value.cast::<T>().map_err(Failure::new)));
        Pending::view(self.id, future)
    }
}

impl<T: StateValue> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            future: self.future.clone(),
        }
    }
}

impl<T> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pending(#{})", self.id)
    }
}

impl<T: StateValue> IntoFuture for Pending<T> {
    type Output = Result<T, Failure>;
    type IntoFuture = SharedResult<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.future
    }
}

/// A value that may still be loading or may have failed.
pub enum Loadable<T> {
    Resolved(T),
    Pending(Pending<T>),
    Failed(Failure),
}

impl<T> Loadable<T> {
    /// Get the current state.
    pub fn state(&self) -> LoadableState {
        match self {
            Loadable::Resolved(_) => LoadableState::HasValue,
            Loadable::Pending(_) => LoadableState::Loading,
            Loadable::Failed(_) => LoadableState::HasError,
        }
    }

    /// Whether a value is available.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Loadable::Resolved(_))
    }

    /// Whether the value is still loading.
    pub fn is_pending(&self) -> bool {
        matches!(self, Loadable::Pending(_))
    }

    /// Whether loading failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Loadable::Failed(_))
    }

    /// Get the value, if resolved.
    pub fn value(&self) -> Option<&T> {
        match self {
            Loadable::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// Get the failure, if failed.
    pub fn error(&self) -> Option<&Failure> {
        match self {
            Loadable::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Get the pending future, if loading.
    pub fn pending(&self) -> Option<&Pending<T>> {
        match self {
            Loadable::Pending(pending) => Some(pending),
            _ => None,
        }
    }

    /// The resolved value, or [`StateError::InvalidState`].
    pub fn try_value(&self) -> Result<&T, StateError> {
        self.value()
            .ok_or_else(|| self.invalid_state(LoadableState::HasValue))
    }

    /// The failure, or [`StateError::InvalidState`].
    pub fn try_error(&self) -> Result<&Failure, StateError> {
        self.error()
            .ok_or_else(|| self.invalid_state(LoadableState::HasError))
    }

    /// The pending future, or [`StateError::InvalidState`].
    pub fn try_pending(&self) -> Result<&Pending<T>, StateError> {
        self.pending()
            .ok_or_else(|| self.invalid_state(LoadableState::Loading))
    }

    fn invalid_state(&self, expected: LoadableState) -> StateError {
        StateError::InvalidState {
            expected,
            actual: self.state(),
        }
    }
}

impl<T: StateValue> Loadable<T> {
    /// A resolved loadable.
    pub fn resolved(value: T) -> Self {
        Loadable::Resolved(value)
    }

    /// A failed loadable carrying `error`.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Loadable::Failed(Failure::new(error))
    }

    /// A pending loadable driven by `future`.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        Loadable::Pending(Pending::new(future))
    }

    /// Pending forever.
    pub fn never() -> Self {
        Loadable::Pending(Pending::never())
    }

    /// Run a computation and capture its outcome.
    ///
    /// An `Interrupt::Pending` produces a pending loadable that re-runs the
    /// computation each time the awaited value settles.
    pub fn run<F>(mut compute: F) -> Self
    where
        F: FnMut() -> Result<T, Interrupt> + Send + 'static,
    {
        match compute() {
            Ok(value) => Loadable::Resolved(value),
            Err(Interrupt::Failed(failure)) => Loadable::Failed(failure),
            Err(Interrupt::Pending(first)) => Loadable::from_future(async move {
                let mut waiting = first;
                loop {
                    waiting.await?;
                    match compute() {
                        Ok(value) => return Ok(value),
                        Err(Interrupt::Failed(failure)) => return Err(failure),
                        Err(Interrupt::Pending(next)) => waiting = next,
                    }
                }
            }),
        }
    }

    /// Value equality for resolved loadables, identity otherwise.
    pub fn is_identical(&self, other: &Self) -> bool {
        self == other
    }

    /// Unwrap into a computation result, for `?` inside selectors.
    pub fn into_result(self) -> Result<T, Interrupt> {
        match self {
            Loadable::Resolved(value) => Ok(value),
            Loadable::Pending(pending) => Err(Interrupt::Pending(pending.erase())),
            Loadable::Failed(failure) => Err(Interrupt::Failed(failure)),
        }
    }

    /// An awaitable for the eventual outcome.
    pub fn to_future(&self) -> BoxFuture<'static, Result<T, Failure>> {
        self.clone().into_future()
    }

    /// Chain a computation onto the value.
    ///
    /// Runs right away when resolved, after settling when pending, and not at
    /// all when failed.
    pub fn map<S, F>(self, f: F) -> Loadable<S>
    where
        S: StateValue,
        F: FnOnce(T) -> Loadable<S> + Send + 'static,
    {
        match self {
            Loadable::Resolved(value) => f(value),
            Loadable::Failed(failure) => Loadable::Failed(failure),
            Loadable::Pending(pending) => Loadable::from_future(async move {
                let value = pending.await?;
                f(value).await
            }),
        }
    }

    /// Erase the payload type.
    pub fn erase(self) -> Loadable<Value> {
        match self {
            Loadable::Resolved(value) => Loadable::Resolved(Value::new(value)),
            Loadable::Pending(pending) => Loadable::Pending(pending.erase()),
            Loadable::Failed(failure) => Loadable::Failed(failure),
        }
    }

    /// Resolved when every input is; the first failure found wins.
    pub fn all<I>(inputs: I) -> Loadable<Vec<T>>
    where
        I: IntoIterator<Item = Loadable<T>>,
    {
        let mut kept = Vec::new();
        for input in inputs {
            if let Loadable::Failed(failure) = input {
                return Loadable::Failed(failure);
            }
            kept.push(input);
        }

        if kept.iter().all(Loadable::is_resolved) {
            let values = kept
                .into_iter()
                .filter_map(|input| match input {
                    Loadable::Resolved(value) => Some(value),
                    _ => None,
                })
                .collect();
            return Loadable::Resolved(values);
        }

        Loadable::from_future(future::try_join_all(
            kept.into_iter().map(IntoFuture::into_future),
        ))
    }

    /// The outcome of every input, once all have settled.
    pub fn all_settled<I>(inputs: I) -> Loadable<Vec<Settled<T>>>
    where
        I: IntoIterator<Item = Loadable<T>>,
    {
        let inputs: Vec<Loadable<T>> = inputs.into_iter().collect();

        if !inputs.iter().any(Loadable::is_pending) {
            let settled = inputs
                .into_iter()
                .filter_map(|input| match input {
                    Loadable::Resolved(value) => Some(Settled::Fulfilled(value)),
                    Loadable::Failed(failure) => Some(Settled::Rejected(failure)),
                    Loadable::Pending(_) => None,
                })
                .collect();
            return Loadable::Resolved(settled);
        }

        Loadable::from_future(async move {
            let outcomes = future::join_all(inputs.into_iter().map(IntoFuture::into_future)).await;
            Ok(outcomes.into_iter().map(Settled::from).collect())
        })
    }

    /// The first input to settle, either way. Empty input never settles.
    pub fn race<I>(inputs: I) -> Loadable<T>
    where
        I: IntoIterator<Item = Loadable<T>>,
    {
        let mut waiting = Vec::new();
        for input in inputs {
            match input {
                Loadable::Pending(pending) => waiting.push(pending.into_future().boxed()),
                settled => return settled,
            }
        }

        if waiting.is_empty() {
            return Loadable::never();
        }

        Loadable::from_future(async move {
            let (outcome, _, _) = future::select_all(waiting).await;
            outcome
        })
    }

    /// The first input to resolve. Failures are skipped; if every input
    /// fails, the result is an [`AggregateFailure`] holding all of them.
    pub fn any<I>(inputs: I) -> Loadable<T>
    where
        I: IntoIterator<Item = Loadable<T>>,
    {
        let mut failures = Vec::new();
        let mut waiting = Vec::new();
        for input in inputs {
            match input {
                Loadable::Resolved(value) => return Loadable::Resolved(value),
                Loadable::Failed(failure) => failures.push(failure),
                Loadable::Pending(pending) => waiting.push(pending),
            }
        }

        if waiting.is_empty() {
            return Loadable::failed(AggregateFailure { failures });
        }

        Loadable::from_future(async move {
            let mut racing: FuturesUnordered<_> =
                waiting.into_iter().map(IntoFuture::into_future).collect();
            while let Some(outcome) = racing.next().await {
                match outcome {
                    Ok(value) => return Ok(value),
                    Err(failure) => failures.push(failure),
                }
            }
            Err(Failure::new(AggregateFailure { failures }))
        })
    }
}

impl Loadable<Value> {
    /// Recover the payload type. A resolved value of another type becomes a
    /// [`StateError::TypeMismatch`] failure.
    pub fn downcast<T: StateValue>(self) -> Loadable<T> {
        match self {
            Loadable::Resolved(value) => match value.cast::<T>() {
                Ok(value) => Loadable::Resolved(value),
                Err(err) => Loadable::Failed(Failure::new(err)),
            },
            Loadable::Pending(pending) => Loadable::Pending(pending.downcast()),
            Loadable::Failed(failure) => Loadable::Failed(failure),
        }
    }
}

impl<T: StateValue> Clone for Loadable<T> {
    fn clone(&self) -> Self {
        match self {
            Loadable::Resolved(value) => Loadable::Resolved(value.clone()),
            Loadable::Pending(pending) => Loadable::Pending(pending.clone()),
            Loadable::Failed(failure) => Loadable::Failed(failure.clone()),
        }
    }
}

impl<T: PartialEq> PartialEq for Loadable<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Loadable::Resolved(a), Loadable::Resolved(b)) => a == b,
            (Loadable::Pending(a), Loadable::Pending(b)) => a == b,
            (Loadable::Failed(a), Loadable::Failed(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Loadable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loadable::Resolved(value) => f.debug_tuple("Resolved").field(value).finish(),
            Loadable::Pending(pending) => fmt::Debug::fmt(pending, f),
            Loadable::Failed(failure) => f.debug_tuple("Failed").field(failure).finish(),
        }
    }
}

impl<T: StateValue> From<T> for Loadable<T> {
    fn from(value: T) -> Self {
        Loadable::Resolved(value)
    }
}

impl<T: StateValue> IntoFuture for Loadable<T> {
    type Output = Result<T, Failure>;
    type IntoFuture = BoxFuture<'static, Result<T, Failure>>;

    fn into_future(self) -> Self::IntoFuture {
        match self {
            Loadable::Resolved(value) => future::ready(Ok(value)).boxed(),
            Loadable::Failed(failure) => future::ready(Err(failure)).boxed(),
            Loadable::Pending(pending) => pending.into_future().boxed(),
        }
    }
}

/// Outcome of one input of [`Loadable::all_settled`].
#[derive(Debug, Clone, PartialEq)]
pub enum Settled<T> {
    Fulfilled(T),
    Rejected(Failure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettledStatus {
    Fulfilled,
    Rejected,
}

impl<T> Settled<T> {
    /// Get the outcome's status.
    pub fn status(&self) -> SettledStatus {
        match self {
            Settled::Fulfilled(_) => SettledStatus::Fulfilled,
            Settled::Rejected(_) => SettledStatus::Rejected,
        }
    }

    /// Get the value, if fulfilled.
    pub fn value(&self) -> Option<&T> {
        match self {
            Settled::Fulfilled(value) => Some(value),
            Settled::Rejected(_) => None,
        }
    }

    /// Get the failure, if rejected.
    pub fn reason(&self) -> Option<&Failure> {
        match self {
            Settled::Fulfilled(_) => None,
            Settled::Rejected(failure) => Some(failure),
        }
    }
}

impl<T> From<Result<T, Failure>> for Settled<T> {
    fn from(outcome: Result<T, Failure>) -> Self {
        match outcome {
            Ok(value) => Settled::Fulfilled(value),
            Err(failure) => Settled::Rejected(failure),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn deferred<T: StateValue>() -> (oneshot::Sender<Result<T, Failure>>, Loadable<T>) {
        let (tx, rx) = oneshot::channel();
        let loadable = Loadable::from_future(async move {
            rx.await.unwrap_or_else(|_| Err(Failure::msg("sender dropped")))
        });
        (tx, loadable)
    }

    #[test]
    fn accessors_match_state() {
        let resolved = Loadable::resolved(3);
        assert_eq!(resolved.state(), LoadableState::HasValue);
        assert_eq!(resolved.value(), Some(&3));
        assert!(resolved.error().is_none());

        let failed: Loadable<i32> = Loadable::Failed(Failure::msg("nope"));
        assert_eq!(failed.state(), LoadableState::HasError);
        assert!(failed.try_value().is_err());
        assert_eq!(failed.try_error().map(ToString::to_string).ok().as_deref(), Some("nope"));

        let pending: Loadable<i32> = Loadable::never();
        assert_eq!(pending.state(), LoadableState::Loading);
        match pending.try_value() {
            Err(StateError::InvalidState { expected, actual }) => {
                assert_eq!(expected, LoadableState::HasValue);
                assert_eq!(actual, LoadableState::Loading);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn identity_rules() {
        assert!(Loadable::resolved(1).is_identical(&Loadable::resolved(1)));

        let pending: Loadable<i32> = Loadable::never();
        assert!(pending.is_identical(&pending.clone()));
        assert!(!pending.is_identical(&Loadable::never()));

        let failure = Failure::msg("x");
        let a: Loadable<i32> = Loadable::Failed(failure.clone());
        let b: Loadable<i32> = Loadable::Failed(failure);
        assert!(a.is_identical(&b));
        assert!(!a.is_identical(&Loadable::Failed(Failure::msg("x"))));
    }

    #[test]
    fn map_runs_eagerly_on_resolved() {
        let mapped = Loadable::resolved(2).map(|v| Loadable::resolved(v * 10));
        assert_eq!(mapped.value(), Some(&20));
    }

    #[test]
    fn map_skips_failed() {
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let failed: Loadable<i32> = Loadable::Failed(Failure::msg("bad"));
        let mapped = failed.clone().map(move |v| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Loadable::resolved(v)
        });

        assert_eq!(mapped, failed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn map_chains_on_pending() {
        let (tx, pending) = deferred::<i32>();
        let mapped = pending.map(|v| Loadable::resolved(v + 1));
        assert!(mapped.is_pending());

        tx.send(Ok(41)).unwrap();
        assert_eq!(mapped.await.unwrap(), 42);
    }

    #[test]
    fn all_fails_fast() {
        let failure = Failure::msg("first");
        let out = Loadable::all(vec![
            Loadable::resolved(1),
            Loadable::Failed(failure.clone()),
            Loadable::never(),
        ]);
        assert_eq!(out.error(), Some(&failure));
    }

    #[tokio::test]
    async fn all_waits_for_pending() {
        let (tx, pending) = deferred::<i32>();
        let out = Loadable::all(vec![Loadable::resolved(1), pending]);
        assert!(out.is_pending());

        tx.send(Ok(2)).unwrap();
        assert_eq!(out.await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn all_settled_reports_each_outcome() {
        let (tx, pending) = deferred::<i32>();
        let out = Loadable::all_settled(vec![Loadable::resolved(1), pending]);

        tx.send(Err(Failure::msg("late"))).unwrap();
        let settled = out.await.unwrap();
        assert_eq!(settled[0], Settled::Fulfilled(1));
        assert_eq!(settled[1].status(), SettledStatus::Rejected);
        assert_eq!(settled[1].reason().map(ToString::to_string).as_deref(), Some("late"));
    }

    #[test]
    fn race_takes_first_settled_input() {
        let out = Loadable::race(vec![Loadable::never(), Loadable::resolved(5), Loadable::resolved(6)]);
        assert_eq!(out.value(), Some(&5));

        let empty: Loadable<i32> = Loadable::race(Vec::new());
        assert!(empty.is_pending());
    }

    #[test]
    fn any_aggregates_when_everything_failed() {
        let out: Loadable<i32> = Loadable::any(vec![
            Loadable::Failed(Failure::msg("a")),
            Loadable::Failed(Failure::msg("b")),
        ]);
        let failure = out.error().expect("should fail");
        let aggregate = failure.downcast_ref::<AggregateFailure>().expect("aggregate");
        assert_eq!(aggregate.failures.len(), 2);
    }

    #[tokio::test]
    async fn any_ignores_rejections_while_others_are_pending() {
        let (tx_a, a) = deferred::<i32>();
        let (tx_b, b) = deferred::<i32>();
        let out = Loadable::any(vec![Loadable::Failed(Failure::msg("early")), a, b]);
        assert!(out.is_pending());

        tx_a.send(Err(Failure::msg("a"))).unwrap();
        tx_b.send(Ok(9)).unwrap();
        assert_eq!(out.await.unwrap(), 9);
    }

    #[tokio::test]
    async fn run_retries_after_pending_interrupt() {
        let (tx, pending) = deferred::<i32>();
        let source = pending.try_pending().unwrap().clone();
        let loadable = Loadable::run(move || match source.peek() {
            Some(Ok(value)) => Ok(value * 2),
            Some(Err(failure)) => Err(Interrupt::Failed(failure)),
            None => Err(Interrupt::Pending(source.erase())),
        });
        assert!(loadable.is_pending());

        tx.send(Ok(21)).unwrap();
        assert_eq!(loadable.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn erase_and_downcast_round_trip_pending() {
        let (tx, pending) = deferred::<String>();
        let id = pending.try_pending().unwrap().id();
        let erased = pending.erase();
        let typed: Loadable<String> = erased.clone().downcast();
        let wrong: Loadable<u8> = erased.downcast();
        assert_eq!(typed.pending().map(Pending::id), Some(id));

        tx.send(Ok("done".to_string())).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(typed.pending().and_then(Pending::peek), Some(Ok("done".to_string())));
        assert_eq!(typed.await.unwrap(), "done");
        let err = wrong.await.unwrap_err();
        assert!(err.is::<StateError>());
    }
}
