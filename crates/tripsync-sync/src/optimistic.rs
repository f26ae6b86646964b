//! Optimistic mutation executor.
//!
//! A mutation is applied locally first, then sent to the store through the
//! [`RetryPolicy`]. Exactly one of `on_success` / `on_error` runs per call,
//! and `on_error` only runs after retries are exhausted (or the failure was
//! permanent).
//!
//! Per call the state moves `Idle -> OptimisticallyApplied -> {Confirmed | RolledBack}`.
//! [`Optimistic`] is the matching value container: a confirmed value with an
//! optional local overlay, updated through pure functions.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::observe::{Breadcrumb, Level};
use crate::retry::{RetryPolicy, Sleep, TokioSleep};

/// Where one mutation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Idle,
    OptimisticallyApplied,
    Confirmed,
    RolledBack,
}

/// A mutation with an optimistic local effect.
pub trait Mutation: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;
    /// Whatever `on_error` needs to restore the pre-mutation state.
    type Snapshot: Send;

    /// Apply the local change. Runs synchronously before any I/O.
    fn on_mutate(&self, input: &Self::Input) -> Self::Snapshot;

    /// The remote call. May run several times under the retry policy.
    fn mutate(&self, input: &Self::Input) -> impl Future<Output = Result<Self::Output>> + Send;

    fn on_success(&self, _output: &Self::Output, _input: &Self::Input) {}

    /// Revert the local change.
    fn on_error(&self, error: &Error, input: &Self::Input, snapshot: Self::Snapshot);
}

/// Runs [`Mutation`]s.
#[derive(Debug, Clone)]
pub struct OptimisticExecutor<S: Sleep = TokioSleep> {
    retry: RetryPolicy<S>,
}

impl<S: Sleep> OptimisticExecutor<S> {
    pub fn new(retry: RetryPolicy<S>) -> Self {
        Self { retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy<S> {
        &self.retry
    }

    /// Apply, send, then confirm or roll back.
    pub async fn execute<M: Mutation>(&self, mutation: &M, input: M::Input) -> Result<M::Output> {
        let snapshot = mutation.on_mutate(&input);
        self.settle(mutation, &input, snapshot).await
    }

    /// Like [`execute`](Self::execute), but `on_mutate` has already run when
    /// this returns; the remote half runs when the future is polled.
    ///
    /// Lets fire-and-forget callers update local state synchronously and
    /// hand the future to `tokio::spawn`.
    pub fn start<M>(
        &self,
        mutation: Arc<M>,
        input: M::Input,
    ) -> impl Future<Output = Result<M::Output>> + Send + 'static
    where
        M: Mutation + 'static,
        M::Input: 'static,
        M::Output: 'static,
        M::Snapshot: 'static,
    {
        let snapshot = mutation.on_mutate(&input);
        let executor = self.clone();
        async move { executor.settle(&*mutation, &input, snapshot).await }
    }

    async fn settle<M: Mutation>(
        &self,
        mutation: &M,
        input: &M::Input,
        snapshot: M::Snapshot,
    ) -> Result<M::Output> {
        debug!(phase = ?MutationPhase::OptimisticallyApplied, "Optimistic change applied");

        match self.retry.execute(move || mutation.mutate(input)).await {
            Ok(output) => {
                mutation.on_success(&output, input);
                debug!(phase = ?MutationPhase::Confirmed, "Mutation confirmed");
                Ok(output)
            }
            Err(err) => {
                mutation.on_error(&err, input, snapshot);
                warn!(phase = ?MutationPhase::RolledBack, kind = err.kind(), "Mutation rolled back: {}", err);
                self.retry.observability().add_breadcrumb(
                    Breadcrumb::new("mutation", "rolled back", Level::Warning)
                        .with("kind", err.kind())
                        .with("error", err.to_string()),
                );
                Err(err)
            }
        }
    }
}

/// A confirmed value with an optional optimistic overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimistic<T> {
    confirmed: T,
    overlay: Option<T>,
    phase: MutationPhase,
}

impl<T: Clone> Optimistic<T> {
    pub fn new(confirmed: T) -> Self {
        Self {
            confirmed,
            overlay: None,
            phase: MutationPhase::Idle,
        }
    }

    /// What the UI should render.
    pub fn view(&self) -> &T {
        self.overlay.as_ref().unwrap_or(&self.confirmed)
    }

    /// Last value the store confirmed.
    pub fn confirmed(&self) -> &T {
        &self.confirmed
    }

    pub fn phase(&self) -> MutationPhase {
        self.phase
    }

    pub fn is_pending(&self) -> bool {
        self.overlay.is_some()
    }

    /// Layer a local change over the current view.
    ///
    /// On error nothing changes.
    pub fn apply<E>(&mut self, change: impl FnOnce(&T) -> std::result::Result<T, E>) -> std::result::Result<(), E> {
        let next = change(self.view())?;
        self.overlay = Some(next);
        self.phase = MutationPhase::OptimisticallyApplied;
        Ok(())
    }

    /// Replace both layers with the store's value.
    pub fn confirm(&mut self, value: T) {
        self.confirmed = value;
        self.overlay = None;
        self.phase = MutationPhase::Confirmed;
    }

    /// Move the confirmed value forward without touching a pending overlay.
    ///
    /// The overlay stays until its own write settles.
    pub fn advance(&mut self, value: T) {
        self.confirmed = value;
        if self.overlay.is_none() {
            self.phase = MutationPhase::Confirmed;
        }
    }

    /// Drop the overlay because the confirmed value already includes it.
    pub fn supersede(&mut self) {
        self.overlay = None;
        self.phase = MutationPhase::Confirmed;
    }

    /// Drop the overlay, reverting to the confirmed value.
    pub fn rollback(&mut self) {
        self.overlay = None;
        self.phase = MutationPhase::RolledBack;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::memory::{RecordingObservability, RecordingSleep};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Adds to a counter locally; the remote call fails `fail_times` times.
    struct AddMutation {
        value: Mutex<i64>,
        calls: AtomicU32,
        fail_times: u32,
        error: fn() -> Error,
        events: Mutex<Vec<&'static str>>,
    }

    impl AddMutation {
        fn new(fail_times: u32, error: fn() -> Error) -> Self {
            Self {
                value: Mutex::new(10),
                calls: AtomicU32::new(0),
                fail_times,
                error,
                events: Mutex::new(Vec::new()),
            }
        }

        fn value(&self) -> i64 {
            *self.value.lock().unwrap()
        }

        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Mutation for AddMutation {
        type Input = i64;
        type Output = i64;
        type Snapshot = i64;

        fn on_mutate(&self, delta: &i64) -> i64 {
            self.events.lock().unwrap().push("mutate");
            let mut value = self.value.lock().unwrap();
            let before = *value;
            *value += delta;
            before
        }

        async fn mutate(&self, delta: &i64) -> Result<i64> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_times {
                Err((self.error)())
            } else {
                Ok(10 + delta)
            }
        }

        fn on_success(&self, _output: &i64, _input: &i64) {
            self.events.lock().unwrap().push("success");
        }

        fn on_error(&self, _error: &Error, _input: &i64, snapshot: i64) {
            self.events.lock().unwrap().push("error");
            *self.value.lock().unwrap() = snapshot;
        }
    }

    fn executor(max_retries: u32) -> OptimisticExecutor<RecordingSleep> {
        let retry = RetryPolicy::new(
            RetryConfig::immediate(max_retries),
            Arc::new(RecordingObservability::default()),
        )
        .with_sleep(RecordingSleep::default());
        OptimisticExecutor::new(retry)
    }

    #[tokio::test]
    async fn success_keeps_optimistic_change() {
        let m = AddMutation::new(1, || Error::Network("blip".into()));
        let out = executor(3).execute(&m, 5).await.unwrap();

        assert_eq!(out, 15);
        assert_eq!(m.value(), 15);
        assert_eq!(m.events(), vec!["mutate", "success"]);
    }

    #[tokio::test]
    async fn exhausted_retries_roll_back() {
        let m = AddMutation::new(u32::MAX, || Error::Network("down".into()));
        let err = executor(3).execute(&m, 5).await.unwrap_err();

        assert!(matches!(err, Error::Network(_)));
        assert_eq!(m.value(), 10);
        assert_eq!(m.calls.load(Ordering::SeqCst), 4);
        assert_eq!(m.events(), vec!["mutate", "error"]);
    }

    #[tokio::test]
    async fn permanent_error_rolls_back_without_retry() {
        let m = AddMutation::new(u32::MAX, || Error::Authentication("expired".into()));
        let err = executor(3).execute(&m, 5).await.unwrap_err();

        assert!(matches!(err, Error::Authentication(_)));
        assert_eq!(m.calls.load(Ordering::SeqCst), 1);
        assert_eq!(m.value(), 10);
    }

    #[tokio::test]
    async fn start_applies_before_polling() {
        let m = Arc::new(AddMutation::new(0, || Error::Unknown("never".into())));
        let fut = executor(0).start(m.clone(), 7);

        assert_eq!(m.value(), 17);
        assert_eq!(m.calls.load(Ordering::SeqCst), 0);

        fut.await.unwrap();
        assert_eq!(m.events(), vec!["mutate", "success"]);
    }

    #[test]
    fn optimistic_cell_lifecycle() {
        let mut cell = Optimistic::new(1);
        assert_eq!(cell.phase(), MutationPhase::Idle);

        cell.apply(|v| Ok::<_, ()>(v + 1)).unwrap();
        assert_eq!(*cell.view(), 2);
        assert_eq!(*cell.confirmed(), 1);
        assert!(cell.is_pending());

        cell.rollback();
        assert_eq!(*cell.view(), 1);
        assert_eq!(cell.phase(), MutationPhase::RolledBack);

        cell.apply(|v| Ok::<_, ()>(v + 5)).unwrap();
        cell.confirm(6);
        assert_eq!(*cell.view(), 6);
        assert_eq!(cell.phase(), MutationPhase::Confirmed);
    }

    #[test]
    fn advance_keeps_pending_overlay() {
        let mut cell = Optimistic::new(1);
        cell.apply(|v| Ok::<_, ()>(v + 1)).unwrap();

        cell.advance(5);
        assert_eq!(*cell.confirmed(), 5);
        assert_eq!(*cell.view(), 2);
        assert_eq!(cell.phase(), MutationPhase::OptimisticallyApplied);

        cell.supersede();
        assert_eq!(*cell.view(), 5);
        assert!(!cell.is_pending());
        assert_eq!(cell.phase(), MutationPhase::Confirmed);
    }

    #[test]
    fn failed_apply_leaves_cell_untouched() {
        let mut cell = Optimistic::new(1);
        assert_eq!(cell.apply(|_| Err("nope")), Err("nope"));
        assert_eq!(cell.phase(), MutationPhase::Idle);
        assert!(!cell.is_pending());
    }
}
