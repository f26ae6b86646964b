//! Reaction tallies.
//!
//! Each user holds at most one reaction per subject. Responding updates the
//! local tally immediately and syncs to the store in the background through
//! the optimistic executor. A failed sync reverts the local change, unless the
//! user has reacted again in the meantime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tripsync_model::{Reaction, ReactionBoard, ReactionTally};

use crate::error::{Error, Result};
use crate::lock;
use crate::optimistic::{Mutation, OptimisticExecutor};
use crate::retry::{Sleep, TokioSleep};

/// A user's new reaction to a subject. `kind: None` removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    pub subject_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl ReactionUpdate {
    pub fn new(subject_id: impl Into<String>, user_id: impl Into<String>, kind: Option<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            user_id: user_id.into(),
            kind,
        }
    }
}

impl From<Reaction> for ReactionUpdate {
    fn from(r: Reaction) -> Self {
        Self::new(r.subject_id, r.user_id, Some(r.kind))
    }
}

/// Where reaction changes are persisted.
pub trait ReactionSink: Send + Sync + 'static {
    fn sync(&self, update: &ReactionUpdate) -> impl Future<Output = Result<()>> + Send;
}

struct Inner<R> {
    sink: R,
    boards: Mutex<HashMap<String, ReactionBoard>>,
}

impl<R> Inner<R> {
    fn set(&self, update: &ReactionUpdate) -> Option<String> {
        lock(&self.boards)
            .entry(update.subject_id.clone())
            .or_insert_with(|| ReactionBoard::new(update.subject_id.clone()))
            .set(&update.user_id, update.kind.as_deref())
    }
}

/// Local reaction state for every subject the client has seen.
pub struct ReactionAggregator<R, S: Sleep = TokioSleep> {
    inner: Arc<Inner<R>>,
    executor: OptimisticExecutor<S>,
}

impl<R, S: Sleep> Clone for ReactionAggregator<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            executor: self.executor.clone(),
        }
    }
}

impl<R: ReactionSink, S: Sleep> ReactionAggregator<R, S> {
    pub fn new(sink: R, executor: OptimisticExecutor<S>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                boards: Mutex::new(HashMap::new()),
            }),
            executor,
        }
    }

    pub fn sink(&self) -> &R {
        &self.inner.sink
    }

    /// Set the user's reaction to `kind`.
    ///
    /// The tally changes before this returns. The sync runs on a spawned task
    /// whose handle is returned; `None` means the reaction was already `kind`
    /// and nothing was sent. Must be called inside a Tokio runtime.
    pub fn respond(&self, subject_id: &str, user_id: &str, kind: &str) -> Option<JoinHandle<Result<()>>> {
        self.submit(ReactionUpdate::new(subject_id, user_id, Some(kind.to_string())))
    }

    /// Remove the user's reaction.
    pub fn retract(&self, subject_id: &str, user_id: &str) -> Option<JoinHandle<Result<()>>> {
        self.submit(ReactionUpdate::new(subject_id, user_id, None))
    }

    fn submit(&self, update: ReactionUpdate) -> Option<JoinHandle<Result<()>>> {
        if self.active(&update.subject_id, &update.user_id) == update.kind {
            return None;
        }
        let mutation = Arc::new(ReactionMutation {
            inner: Arc::clone(&self.inner),
        });
        Some(tokio::spawn(self.executor.start(mutation, update)))
    }

    pub fn tally(&self, subject_id: &str) -> ReactionTally {
        lock(&self.inner.boards)
            .get(subject_id)
            .map(|board| board.tally().clone())
            .unwrap_or_else(|| ReactionTally::new(subject_id))
    }

    pub fn active(&self, subject_id: &str, user_id: &str) -> Option<String> {
        lock(&self.inner.boards)
            .get(subject_id)
            .and_then(|board| board.active(user_id))
            .map(str::to_string)
    }

    /// Apply a reaction change made by another client.
    pub fn apply_remote(&self, update: &ReactionUpdate) {
        let previous = self.inner.set(update);
        debug!(
            subject_id = %update.subject_id,
            user_id = %update.user_id,
            from = ?previous,
            to = ?update.kind,
            "Remote reaction"
        );
    }

    /// Replace a subject's state with the store's snapshot.
    pub fn reconcile(&self, subject_id: &str, reactions: &[Reaction]) {
        let board = ReactionBoard::from_reactions(
            subject_id,
            reactions.iter().filter(|r| r.subject_id == subject_id),
        );
        lock(&self.inner.boards).insert(subject_id.to_string(), board);
    }
}

struct ReactionMutation<R> {
    inner: Arc<Inner<R>>,
}

impl<R: ReactionSink> Mutation for ReactionMutation<R> {
    type Input = ReactionUpdate;
    type Output = ();
    type Snapshot = Option<String>;

    fn on_mutate(&self, update: &ReactionUpdate) -> Option<String> {
        self.inner.set(update)
    }

    async fn mutate(&self, update: &ReactionUpdate) -> Result<()> {
        self.inner.sink.sync(update).await
    }

    fn on_error(&self, error: &Error, update: &ReactionUpdate, previous: Option<String>) {
        let mut boards = lock(&self.inner.boards);
        let Some(board) = boards.get_mut(&update.subject_id) else {
            return;
        };
        if board.active(&update.user_id) != update.kind.as_deref() {
            debug!(
                subject_id = %update.subject_id,
                user_id = %update.user_id,
                "Reaction changed since failed sync, keeping newer state"
            );
            return;
        }
        board.set(&update.user_id, previous.as_deref());
        warn!(
            subject_id = %update.subject_id,
            user_id = %update.user_id,
            kind = error.kind(),
            "Reaction sync failed, reverted"
        );
    }
}
