//! Sending chat messages.
//!
//! A send is checked locally (content, per-author rate) before anything goes
//! over the network. The message then shows up in the scope's feed under a
//! `pending:<n>` id and is swapped for the stored message once the store
//! confirms it, or removed if the send fails. The feed hands out the ids, so
//! any number of senders can share one feed.

use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};
use tripsync_model::{Message, MessageDraft, Timestamp};

use crate::context::ScopeFeed;
use crate::error::{Error, Result};
use crate::optimistic::{Mutation, OptimisticExecutor};
use crate::rate_limit::{author_key, with_limiter, SharedRateLimiter};
use crate::retry::{Sleep, TokioSleep};

/// Prefix of locally assigned message ids.
pub const PENDING_PREFIX: &str = "pending:";

/// Where messages are stored. Assigns the final id and timestamp.
pub trait MessageSink: Send + Sync + 'static {
    fn send(&self, draft: &MessageDraft) -> impl Future<Output = Result<Message>> + Send;
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Sends messages with optimistic feed entries.
pub struct ChatSender<M, S: Sleep = TokioSleep> {
    sink: Arc<M>,
    executor: OptimisticExecutor<S>,
    limiter: SharedRateLimiter,
}

impl<M, S: Sleep> Clone for ChatSender<M, S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            executor: self.executor.clone(),
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<M: MessageSink, S: Sleep> ChatSender<M, S> {
    pub fn new(sink: M, executor: OptimisticExecutor<S>, limiter: SharedRateLimiter) -> Self {
        Self {
            sink: Arc::new(sink),
            executor,
            limiter,
        }
    }

    pub fn sink(&self) -> &M {
        &self.sink
    }

    /// Send `draft` into `feed`.
    ///
    /// Validation and rate-limit failures return before the feed is touched.
    pub async fn send(&self, feed: &ScopeFeed, draft: MessageDraft) -> Result<Message> {
        if draft.scope_id != feed.scope_id() {
            return Err(Error::NotFound(format!(
                "scope {} is not the feed's scope {}",
                draft.scope_id,
                feed.scope_id()
            )));
        }
        let draft = draft.validate()?;

        let key = author_key(&draft.scope_id, &draft.author_id);
        with_limiter(&self.limiter, |limiter| limiter.check(&key))?;

        let mutation = SendMessage {
            sink: Arc::clone(&self.sink),
            feed: feed.clone(),
            pending: draft.to_pending(feed.next_local_id(), now_millis()),
        };
        self.executor.execute(&mutation, draft).await
    }
}

struct SendMessage<M> {
    sink: Arc<M>,
    feed: ScopeFeed,
    pending: Message,
}

impl<M: MessageSink> Mutation for SendMessage<M> {
    type Input = MessageDraft;
    type Output = Message;
    type Snapshot = ();

    fn on_mutate(&self, _draft: &MessageDraft) {
        let outcome = self.feed.apply_local(|buffer| buffer.ingest(self.pending.to_event()));
        debug!(scope_id = %self.pending.scope_id, id = %self.pending.id, ?outcome, "Pending message added");
    }

    async fn mutate(&self, draft: &MessageDraft) -> Result<Message> {
        self.sink.send(draft).await
    }

    fn on_success(&self, message: &Message, _draft: &MessageDraft) {
        self.feed
            .apply_local(|buffer| buffer.reconcile(&self.pending.id, message.to_event()));
        debug!(scope_id = %message.scope_id, pending = %self.pending.id, id = %message.id, "Message confirmed");
    }

    fn on_error(&self, error: &Error, _draft: &MessageDraft, _snapshot: ()) {
        self.feed.apply_local(|buffer| buffer.discard(&self.pending.id));
        warn!(scope_id = %self.pending.scope_id, pending = %self.pending.id, kind = error.kind(), "Message not sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitConfig, RetryConfig};
    use crate::memory::{MemoryMessageSink, RecordingObservability, RecordingSleep};
    use crate::rate_limit;
    use crate::retry::RetryPolicy;
    use tripsync_model::ModelError;

    fn sender(sink: MemoryMessageSink, limit: RateLimitConfig) -> ChatSender<MemoryMessageSink, RecordingSleep> {
        let retry = RetryPolicy::new(RetryConfig::immediate(1), Arc::new(RecordingObservability::default()))
            .with_sleep(RecordingSleep::default());
        ChatSender::new(sink, OptimisticExecutor::new(retry), rate_limit::shared(limit))
    }

    fn draft(content: &str) -> MessageDraft {
        MessageDraft::new("trip-1", "u1", "Ana", content)
    }

    #[tokio::test]
    async fn confirmed_message_replaces_pending() {
        let sink = MemoryMessageSink::default();
        let chat = sender(sink.clone(), RateLimitConfig::message_send());
        let feed = ScopeFeed::detached("trip-1", 100);

        let message = chat.send(&feed, draft("  hello  ")).await.unwrap();

        assert_eq!(message.content, "hello");
        let ids: Vec<_> = feed.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![message.id.clone()]);
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_removes_pending() {
        let sink = MemoryMessageSink::default();
        sink.fail_next(Error::Network("down".into()));
        sink.fail_next(Error::Network("down".into()));
        let chat = sender(sink.clone(), RateLimitConfig::message_send());
        let feed = ScopeFeed::detached("trip-1", 100);

        let err = chat.send(&feed, draft("hello")).await.unwrap_err();

        assert!(matches!(err, Error::Network(_)));
        assert!(feed.is_empty());
    }

    #[tokio::test]
    async fn invalid_content_never_sent() {
        let sink = MemoryMessageSink::default();
        let chat = sender(sink.clone(), RateLimitConfig::message_send());
        let feed = ScopeFeed::detached("trip-1", 100);

        let err = chat.send(&feed, draft("   ")).await.unwrap_err();

        assert!(matches!(err, Error::Validation(ModelError::EmptyContent)));
        assert!(sink.sent().is_empty());
        assert!(feed.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_rejects_without_network() {
        let sink = MemoryMessageSink::default();
        let chat = sender(sink.clone(), RateLimitConfig::new(2, 60_000));
        let feed = ScopeFeed::detached("trip-1", 100);

        chat.send(&feed, draft("one")).await.unwrap();
        chat.send(&feed, draft("two")).await.unwrap();
        let err = chat.send(&feed, draft("three")).await.unwrap_err();

        assert!(matches!(err, Error::RateLimited { key } if key == "trip-1:u1"));
        assert_eq!(sink.sent().len(), 2);

        // Other authors have their own budget.
        let other = MessageDraft::new("trip-1", "u2", "Ben", "hi");
        assert!(chat.send(&feed, other).await.is_ok());
    }

    #[tokio::test]
    async fn echo_after_confirmation_is_not_duplicated() {
        let sink = MemoryMessageSink::default();
        let chat = sender(sink.clone(), RateLimitConfig::message_send());
        let feed = ScopeFeed::detached("trip-1", 100);

        let message = chat.send(&feed, draft("hello")).await.unwrap();
        feed.apply_local(|buffer| buffer.ingest(message.to_event()));

        assert_eq!(feed.len(), 1);
    }

    #[test]
    fn local_ids_are_shared_across_senders() {
        let feed = ScopeFeed::detached("trip-1", 100);
        let other = feed.clone();

        assert_eq!(feed.next_local_id(), "pending:1");
        assert_eq!(other.next_local_id(), "pending:2");
    }
}
