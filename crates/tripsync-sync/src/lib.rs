//! Tripsync Sync - real-time sync and optimistic concurrency for shared trip state.
//!
//! Many clients edit the same trip at once over an at-least-once push channel.
//! This crate keeps each client's view consistent:
//!
//! - **Inbound**: [`ScopeSubscriber`] → ingest [`RateLimiter`] → [`OrderedBuffer`],
//!   exposed per trip as a [`ScopeFeed`]. Duplicates are dropped and order is
//!   always `(occurred_at, id)`.
//! - **Outbound**: [`OptimisticExecutor`] applies a change locally, sends it
//!   through the [`RetryPolicy`], and confirms or rolls back.
//!   [`CasCoordinator`] adds compare-and-swap on versioned resources,
//!   [`ReactionAggregator`] keeps reaction tallies, and [`ChatSender`] posts
//!   messages.
//!
//! Everything hangs off a [`SyncContext`], which owns the shared state and the
//! collaborators (bus, store, observability, notifications, push).
//!
//! # Example
//!
//! ```no_run
//! use tripsync_sync::memory::{MemoryBus, MemoryHistory, MemoryMessageSink};
//! use tripsync_sync::SyncContext;
//! use tripsync_model::MessageDraft;
//!
//! # async fn run() -> tripsync_sync::Result<()> {
//! let ctx = SyncContext::builder(MemoryBus::new(), MemoryHistory::default()).build()?;
//! ctx.init().await?;
//!
//! let feed = ctx.open_scope("trip-1").await?;
//! let chat = ctx.chat_sender(MemoryMessageSink::default());
//! chat.send(&feed, MessageDraft::new("trip-1", "u1", "Ana", "Leaving at 8")).await?;
//!
//! ctx.dispose();
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod buffer;
pub mod cas;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod observe;
pub mod optimistic;
pub mod push;
pub mod rate_limit;
pub mod reactions;
pub mod retry;
pub mod subscriber;

pub use buffer::{DropReason, IngestOutcome, OrderedBuffer, ScopeChange};
pub use cas::{CasCoordinator, CasOutcome, CasResponse, CasWrite, ResourceSource, VersionedStore};
pub use chat::{ChatSender, MessageSink};
pub use config::{BackoffConfig, RateLimitConfig, RetryConfig, SyncConfig};
pub use context::{HistorySource, ScopeFeed, SyncContext, SyncContextBuilder};
pub use error::{Error, Result, Transience};
pub use observe::{Breadcrumb, Level, Notice, NoticeKind, Notifier, Observability};
pub use optimistic::{Mutation, MutationPhase, Optimistic, OptimisticExecutor};
pub use push::{Permission, Platform, PushCapability, PushNotification, PushToken};
pub use rate_limit::{RateLimiter, SharedRateLimiter};
pub use reactions::{ReactionAggregator, ReactionSink, ReactionUpdate};
pub use retry::{MutationAttempt, RetryPolicy, Sleep, TokioSleep};
pub use subscriber::{ChangeBus, ChangeRecord, ScopeSubscriber, Subscription};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
