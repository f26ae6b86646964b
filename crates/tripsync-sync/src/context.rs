//! Application-root state container.
//!
//! A [`SyncContext`] owns every piece of shared client state: open scope
//! feeds, rate limiters, the bus subscriber and the collaborators. Build one
//! per application (or per test), call [`init`](SyncContext::init), and
//! [`dispose`](SyncContext::dispose) it on shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use tripsync_model::{EventKey, Message, StreamEvent};

use crate::buffer::{IngestOutcome, OrderedBuffer, ScopeChange};
use crate::cas::CasCoordinator;
use crate::chat::{ChatSender, MessageSink, PENDING_PREFIX};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::lock;
use crate::observe::{Notifier, Observability, TracingNotifier, TracingObservability};
use crate::optimistic::OptimisticExecutor;
use crate::push::{Permission, PushCapability, PushNotification, PushToken};
use crate::rate_limit::{self, with_limiter, SharedRateLimiter};
use crate::reactions::{ReactionAggregator, ReactionSink};
use crate::retry::{RetryPolicy, Sleep, TokioSleep};
use crate::subscriber::{ChangeBus, ScopeSubscriber, Subscription};

/// The store's paginated history query.
pub trait HistorySource: Send + Sync + 'static {
    /// Up to `limit` events of `scope_id` strictly older than `before`
    /// (newest history when `before` is `None`).
    fn fetch_before(
        &self,
        scope_id: &str,
        before: Option<&EventKey>,
        limit: usize,
    ) -> BoxFuture<'static, Result<Vec<StreamEvent>>>;
}

struct FeedInner {
    scope_id: String,
    buffer: Mutex<OrderedBuffer>,
    revision: watch::Sender<u64>,
    subscription: Mutex<Option<Subscription>>,
    history: Option<Arc<dyn HistorySource>>,
    /// Sequence for local entry ids, shared by every sender on this feed.
    next_local: AtomicU64,
}

/// Live view of one scope's event stream.
#[derive(Clone)]
pub struct ScopeFeed {
    inner: Arc<FeedInner>,
}

impl ScopeFeed {
    fn new(scope_id: &str, capacity: usize, history: Option<Arc<dyn HistorySource>>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(FeedInner {
                scope_id: scope_id.to_string(),
                buffer: Mutex::new(OrderedBuffer::new(scope_id, capacity)),
                revision,
                subscription: Mutex::new(None),
                history,
                next_local: AtomicU64::new(1),
            }),
        }
    }

    /// A feed with no bus subscription and no history.
    pub fn detached(scope_id: &str, capacity: usize) -> Self {
        Self::new(scope_id, capacity, None)
    }

    pub fn scope_id(&self) -> &str {
        &self.inner.scope_id
    }

    /// Buffered events in order.
    pub fn snapshot(&self) -> Vec<StreamEvent> {
        lock(&self.inner.buffer).events().to_vec()
    }

    /// Buffered events decoded as chat messages. Other rows are skipped.
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.inner.buffer)
            .events()
            .iter()
            .filter_map(Message::from_event)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.buffer).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.buffer).is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.inner.buffer).contains(id)
    }

    pub fn has_evicted(&self) -> bool {
        lock(&self.inner.buffer).has_evicted()
    }

    /// Revision counter, bumped whenever the buffer changes.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Wait until `condition` holds for the buffered events.
    pub async fn wait_until(&self, condition: impl Fn(&[StreamEvent]) -> bool) {
        let mut revisions = self.watch();
        loop {
            if condition(lock(&self.inner.buffer).events()) {
                return;
            }
            if revisions.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fetch up to `limit` events older than the hot window.
    ///
    /// Results come back sorted and without ids already buffered. They are
    /// not inserted into the feed.
    pub async fn backfill(&self, limit: usize) -> Result<Vec<StreamEvent>> {
        let Some(history) = self.inner.history.clone() else {
            return Ok(Vec::new());
        };
        let (cursor, buffered): (Option<EventKey>, HashSet<String>) = {
            let buffer = lock(&self.inner.buffer);
            (
                buffer.oldest_cursor(),
                buffer.events().iter().map(|e| e.id.clone()).collect(),
            )
        };

        let fetched = history
            .fetch_before(&self.inner.scope_id, cursor.as_ref(), limit)
            .await?;

        let mut seen = HashSet::new();
        let mut events: Vec<StreamEvent> = fetched
            .into_iter()
            .filter(|e| e.scope_id == self.inner.scope_id)
            .filter(|e| cursor.as_ref().map_or(true, |c| e.key() < *c))
            .filter(|e| !buffered.contains(&e.id) && seen.insert(e.id.clone()))
            .collect();
        events.sort_by_key(StreamEvent::key);
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }

        debug!(scope_id = %self.inner.scope_id, count = events.len(), cursor = ?cursor, "Backfilled");
        Ok(events)
    }

    /// Stop receiving bus events. Safe to call more than once.
    pub fn close(&self) {
        if let Some(subscription) = lock(&self.inner.subscription).take() {
            subscription.unsubscribe();
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.subscription)
            .as_ref()
            .map_or(true, |s| !s.is_active())
    }

    /// Fresh id for an optimistic entry, unique within this feed.
    pub(crate) fn next_local_id(&self) -> String {
        let n = self.inner.next_local.fetch_add(1, Ordering::Relaxed);
        format!("{PENDING_PREFIX}{n}")
    }

    /// Change the buffer from local code (optimistic entries).
    pub(crate) fn apply_local<R>(&self, f: impl FnOnce(&mut OrderedBuffer) -> R) -> R {
        let result = f(&mut lock(&self.inner.buffer));
        self.inner.revision.send_modify(|r| *r += 1);
        result
    }

    fn apply_remote(&self, change: ScopeChange) -> IngestOutcome {
        let outcome = lock(&self.inner.buffer).apply(change);
        if outcome.is_applied() {
            self.inner.revision.send_modify(|r| *r += 1);
        }
        outcome
    }

    fn attach(&self, subscription: Subscription) {
        *lock(&self.inner.subscription) = Some(subscription);
    }
}

impl std::fmt::Debug for ScopeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeFeed")
            .field("scope_id", &self.inner.scope_id)
            .field("len", &self.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Disposed,
}

/// Builds a [`SyncContext`].
pub struct SyncContextBuilder<B, H, S: Sleep = TokioSleep> {
    bus: B,
    history: H,
    config: SyncConfig,
    observability: Arc<dyn Observability>,
    notifier: Arc<dyn Notifier>,
    sleep: S,
    push: Option<Arc<dyn PushCapability>>,
}

impl<B: ChangeBus, H: HistorySource, S: Sleep> SyncContextBuilder<B, H, S> {
    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn observability(mut self, observability: Arc<dyn Observability>) -> Self {
        self.observability = observability;
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn push(mut self, push: Arc<dyn PushCapability>) -> Self {
        self.push = Some(push);
        self
    }

    #[must_use]
    pub fn sleep<T: Sleep>(self, sleep: T) -> SyncContextBuilder<B, H, T> {
        SyncContextBuilder {
            bus: self.bus,
            history: self.history,
            config: self.config,
            observability: self.observability,
            notifier: self.notifier,
            sleep,
            push: self.push,
        }
    }

    pub fn build(self) -> Result<SyncContext<B, S>> {
        let config = self.config.validated()?;
        let subscriber = ScopeSubscriber::with_sleep(
            self.bus,
            config.reconnect.clone(),
            Arc::clone(&self.observability),
            self.sleep.clone(),
        );
        Ok(SyncContext {
            send_limiter: rate_limit::shared(config.send_limit),
            ingest_limiter: rate_limit::shared(config.ingest_limit),
            history: Arc::new(self.history),
            observability: self.observability,
            notifier: self.notifier,
            sleep: self.sleep,
            push: self.push,
            push_token: Arc::new(Mutex::new(None)),
            subscriber,
            scopes: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle::Created),
            config,
        })
    }
}

/// Owns the sync core's shared state.
pub struct SyncContext<B, S: Sleep = TokioSleep> {
    config: SyncConfig,
    observability: Arc<dyn Observability>,
    notifier: Arc<dyn Notifier>,
    sleep: S,
    subscriber: ScopeSubscriber<B, S>,
    history: Arc<dyn HistorySource>,
    send_limiter: SharedRateLimiter,
    ingest_limiter: SharedRateLimiter,
    push: Option<Arc<dyn PushCapability>>,
    push_token: Arc<Mutex<Option<PushToken>>>,
    scopes: Mutex<HashMap<String, ScopeFeed>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<B: ChangeBus> SyncContext<B, TokioSleep> {
    /// Start building a context with tracing-backed collaborators and default config.
    pub fn builder<H: HistorySource>(bus: B, history: H) -> SyncContextBuilder<B, H, TokioSleep> {
        SyncContextBuilder {
            bus,
            history,
            config: SyncConfig::default(),
            observability: Arc::new(TracingObservability),
            notifier: Arc::new(TracingNotifier),
            sleep: TokioSleep,
            push: None,
        }
    }
}

impl<B: ChangeBus, S: Sleep> SyncContext<B, S> {
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscriber(&self) -> &ScopeSubscriber<B, S> {
        &self.subscriber
    }

    pub fn observability(&self) -> &Arc<dyn Observability> {
        &self.observability
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.lifecycle) == Lifecycle::Running
    }

    pub fn is_disposed(&self) -> bool {
        *lock(&self.lifecycle) == Lifecycle::Disposed
    }

    /// Start the context. Registers for push notifications when a push
    /// capability was supplied; a push failure is logged, not fatal.
    ///
    /// Calling `init` on a running context does nothing.
    pub async fn init(&self) -> Result<()> {
        match *lock(&self.lifecycle) {
            Lifecycle::Disposed => return Err(Error::Disposed),
            Lifecycle::Running => return Ok(()),
            Lifecycle::Created => {}
        }

        if let Some(push) = self.push.clone() {
            if let Err(err) = self.register_push(push.as_ref()).await {
                warn!(platform = %push.platform(), "Push registration failed: {}", err);
                self.observability.capture_exception(&err, "push registration");
            }
        }

        let mut lifecycle = lock(&self.lifecycle);
        if *lifecycle == Lifecycle::Disposed {
            return Err(Error::Disposed);
        }
        *lifecycle = Lifecycle::Running;
        info!(
            buffer_capacity = self.config.buffer_capacity,
            max_retries = self.config.retry.max_retries,
            "Sync context initialized"
        );
        Ok(())
    }

    async fn register_push(&self, push: &dyn PushCapability) -> Result<()> {
        let permission = push.request_permission().await?;
        if permission != Permission::Granted {
            info!(platform = %push.platform(), ?permission, "Push permission not granted");
            return Ok(());
        }

        let token = push.register().await?;
        info!(platform = %token.platform, "Registered for push");
        *lock(&self.push_token) = Some(token);

        let slot = Arc::clone(&self.push_token);
        push.on_token_refresh(Arc::new(move |token: &PushToken| {
            debug!(platform = %token.platform, "Push token refreshed");
            *lock(&slot) = Some(token.clone());
        }));
        push.on_notification(Arc::new(|notification: &PushNotification| {
            debug!(title = %notification.title, "Push notification received");
        }));
        Ok(())
    }

    /// Current push token, if registered.
    pub fn push_token(&self) -> Option<PushToken> {
        lock(&self.push_token).clone()
    }

    pub fn push(&self) -> Option<&Arc<dyn PushCapability>> {
        self.push.as_ref()
    }

    /// Open (or return the already open) feed for `scope_id`.
    ///
    /// Bus changes go through the per-scope ingest limiter into the feed's
    /// buffer; changes over the limit are dropped.
    pub async fn open_scope(&self, scope_id: &str) -> Result<ScopeFeed> {
        self.ensure_running()?;
        if let Some(feed) = lock(&self.scopes).get(scope_id) {
            return Ok(feed.clone());
        }

        let feed = ScopeFeed::new(scope_id, self.config.buffer_capacity, Some(Arc::clone(&self.history)));
        let sink = feed.clone();
        let limiter = Arc::clone(&self.ingest_limiter);
        let key = scope_id.to_string();

        let subscription = self
            .subscriber
            .subscribe(scope_id, move |change: &ScopeChange| {
                if !with_limiter(&limiter, |l| l.allow(&key)) {
                    debug!(scope_id = %key, id = %change.event.id, "Ingest rate limit hit, dropping");
                    return;
                }
                let outcome = sink.apply_remote(change.clone());
                trace!(scope_id = %key, id = %change.event.id, kind = %change.kind, ?outcome, "Ingested");
            })
            .await?;

        let mut scopes = lock(&self.scopes);
        if *lock(&self.lifecycle) == Lifecycle::Disposed {
            subscription.unsubscribe();
            return Err(Error::Disposed);
        }
        if let Some(existing) = scopes.get(scope_id) {
            // Opened concurrently; keep the first feed.
            subscription.unsubscribe();
            return Ok(existing.clone());
        }
        feed.attach(subscription);
        scopes.insert(scope_id.to_string(), feed.clone());
        info!(scope_id, "Opened scope");
        Ok(feed)
    }

    pub fn scope(&self, scope_id: &str) -> Option<ScopeFeed> {
        lock(&self.scopes).get(scope_id).cloned()
    }

    pub fn open_scopes(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.scopes).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close a scope's feed. Returns false if it was not open.
    pub fn close_scope(&self, scope_id: &str) -> bool {
        let Some(feed) = lock(&self.scopes).remove(scope_id) else {
            return false;
        };
        feed.close();
        info!(scope_id, "Closed scope");
        true
    }

    /// Close every scope and stop the context. Safe to call more than once.
    ///
    /// In-flight mutations are not cancelled; their results are ignored.
    pub fn dispose(&self) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle == Lifecycle::Disposed {
                return;
            }
            *lifecycle = Lifecycle::Disposed;
        }

        let feeds: Vec<ScopeFeed> = lock(&self.scopes).drain().map(|(_, feed)| feed).collect();
        for feed in &feeds {
            feed.close();
        }
        self.subscriber.close_all();
        lock(&self.push_token).take();
        info!(scopes = feeds.len(), "Sync context disposed");
    }

    fn ensure_running(&self) -> Result<()> {
        match *lock(&self.lifecycle) {
            Lifecycle::Running => Ok(()),
            Lifecycle::Disposed => Err(Error::Disposed),
            Lifecycle::Created => Err(Error::Config("sync context not initialized".into())),
        }
    }

    /// Retry policy wired to this context's collaborators.
    pub fn retry_policy(&self) -> RetryPolicy<S> {
        RetryPolicy::new(self.config.retry.clone(), Arc::clone(&self.observability))
            .with_sleep(self.sleep.clone())
            .with_notifier(Arc::clone(&self.notifier))
    }

    pub fn executor(&self) -> OptimisticExecutor<S> {
        OptimisticExecutor::new(self.retry_policy())
    }

    /// Chat sender sharing this context's per-author send limits.
    pub fn chat_sender<M: MessageSink>(&self, sink: M) -> ChatSender<M, S> {
        ChatSender::new(sink, self.executor(), Arc::clone(&self.send_limiter))
    }

    pub fn cas_coordinator<T, St>(&self, store: St) -> CasCoordinator<T, St, S>
    where
        T: Clone + Send + Sync + 'static,
    {
        CasCoordinator::new(store, self.executor(), self.config.max_conflict_retries)
    }

    pub fn reactions<R: ReactionSink>(&self, sink: R) -> ReactionAggregator<R, S> {
        ReactionAggregator::new(sink, self.executor())
    }
}

impl<B, S: Sleep> Drop for SyncContext<B, S> {
    fn drop(&mut self) {
        let disposed = *lock(&self.lifecycle) == Lifecycle::Disposed;
        if !disposed {
            for (_, feed) in lock(&self.scopes).drain() {
                feed.close();
            }
            *lock(&self.lifecycle) = Lifecycle::Disposed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::memory::{LocalPush, MemoryBus, MemoryHistory, RecordingSleep};
    use crate::push::Platform;
    use crate::subscriber::ChangeRecord;
    use serde_json::json;
    use std::time::Duration;
    use tripsync_model::ChangeKind;

    fn record(kind: ChangeKind, id: &str, at: u64) -> ChangeRecord {
        ChangeRecord::new(kind, "trip-1", json!({"id": id, "created_at": at}))
    }

    async fn running(bus: MemoryBus, history: MemoryHistory, config: SyncConfig) -> SyncContext<MemoryBus, RecordingSleep> {
        let ctx = SyncContext::builder(bus, history)
            .config(config)
            .sleep(RecordingSleep::default())
            .build()
            .unwrap();
        ctx.init().await.unwrap();
        ctx
    }

    async fn settle(feed: &ScopeFeed, condition: impl Fn(&[StreamEvent]) -> bool) {
        tokio::time::timeout(Duration::from_secs(1), feed.wait_until(condition))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn requires_init() {
        let ctx = SyncContext::builder(MemoryBus::new(), MemoryHistory::default())
            .build()
            .unwrap();
        assert!(matches!(ctx.open_scope("trip-1").await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn out_of_order_and_duplicate_delivery() {
        let bus = MemoryBus::new();
        let ctx = running(bus.clone(), MemoryHistory::default(), SyncConfig::default()).await;
        let feed = ctx.open_scope("trip-1").await.unwrap();

        bus.publish(record(ChangeKind::Insert, "m3", 30));
        bus.publish(record(ChangeKind::Insert, "m1", 10));
        bus.publish(record(ChangeKind::Insert, "m1", 10));
        bus.publish(record(ChangeKind::Insert, "m2", 20));
        settle(&feed, |events| events.len() == 3).await;

        let ids: Vec<_> = feed.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn delete_and_update_flow_through() {
        let bus = MemoryBus::new();
        let ctx = running(bus.clone(), MemoryHistory::default(), SyncConfig::default()).await;
        let feed = ctx.open_scope("trip-1").await.unwrap();

        bus.publish(record(ChangeKind::Insert, "m1", 10));
        bus.publish(record(ChangeKind::Insert, "m2", 20));
        bus.publish(record(ChangeKind::Delete, "m1", 10));
        bus.publish(ChangeRecord::new(
            ChangeKind::Update,
            "trip-1",
            json!({"id": "m2", "created_at": 20, "content": "edited"}),
        ));
        settle(&feed, |events| {
            events.len() == 1 && events[0].payload.get("content").is_some()
        })
        .await;

        assert!(!feed.contains("m1"));
    }

    #[tokio::test]
    async fn open_scope_reuses_feed() {
        let bus = MemoryBus::new();
        let ctx = running(bus.clone(), MemoryHistory::default(), SyncConfig::default()).await;

        let a = ctx.open_scope("trip-1").await.unwrap();
        let b = ctx.open_scope("trip-1").await.unwrap();
        bus.publish(record(ChangeKind::Insert, "m1", 1));
        settle(&a, |events| events.len() == 1).await;

        assert_eq!(b.len(), 1);
        assert_eq!(bus.opens("scope:trip-1"), 1);
        assert_eq!(ctx.open_scopes(), vec!["trip-1".to_string()]);
    }

    #[tokio::test]
    async fn ingest_limit_drops_floods() {
        let bus = MemoryBus::new();
        let config = SyncConfig::default().with_ingest_limit(RateLimitConfig::new(2, 60_000));
        let ctx = running(bus.clone(), MemoryHistory::default(), config).await;
        let feed = ctx.open_scope("trip-1").await.unwrap();

        for i in 0..5 {
            bus.publish(record(ChangeKind::Insert, &format!("m{i}"), i));
        }
        settle(&feed, |events| events.len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(feed.len(), 2);
    }

    #[tokio::test]
    async fn backfill_reads_below_hot_window() {
        let bus = MemoryBus::new();
        let history = MemoryHistory::default();
        for i in 1..=5 {
            history.insert(StreamEvent::new(format!("m{i}"), "trip-1", i * 10, json!({})));
        }
        let config = SyncConfig::default().with_buffer_capacity(2);
        let ctx = running(bus.clone(), history, config).await;
        let feed = ctx.open_scope("trip-1").await.unwrap();

        bus.publish(record(ChangeKind::Insert, "m3", 30));
        bus.publish(record(ChangeKind::Insert, "m4", 40));
        bus.publish(record(ChangeKind::Insert, "m5", 50));
        settle(&feed, |events| events.first().is_some_and(|e| e.id == "m4")).await;
        assert!(feed.has_evicted());

        let older = feed.backfill(10).await.unwrap();
        let ids: Vec<_> = older.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        let limited = feed.backfill(1).await.unwrap();
        assert_eq!(limited[0].id, "m3");
    }

    #[tokio::test]
    async fn close_scope_stops_delivery() {
        let bus = MemoryBus::new();
        let ctx = running(bus.clone(), MemoryHistory::default(), SyncConfig::default()).await;
        let feed = ctx.open_scope("trip-1").await.unwrap();

        assert!(ctx.close_scope("trip-1"));
        assert!(!ctx.close_scope("trip-1"));
        assert!(feed.is_closed());

        bus.publish(record(ChangeKind::Insert, "m1", 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(feed.is_empty());
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_final() {
        let bus = MemoryBus::new();
        let ctx = running(bus.clone(), MemoryHistory::default(), SyncConfig::default()).await;
        let feed = ctx.open_scope("trip-1").await.unwrap();

        ctx.dispose();
        ctx.dispose();

        assert!(ctx.is_disposed());
        assert!(feed.is_closed());
        assert_eq!(ctx.subscriber().channel_count(), 0);
        assert!(matches!(ctx.open_scope("trip-2").await, Err(Error::Disposed)));
        assert!(matches!(ctx.init().await, Err(Error::Disposed)));
    }

    #[tokio::test]
    async fn init_registers_push_when_granted() {
        let push = Arc::new(LocalPush::new(Platform::Ios, Permission::Granted));
        let ctx = SyncContext::builder(MemoryBus::new(), MemoryHistory::default())
            .push(push.clone())
            .build()
            .unwrap();
        ctx.init().await.unwrap();

        assert_eq!(ctx.push_token().map(|t| t.platform), Some(Platform::Ios));

        push.refresh_token("rotated");
        assert_eq!(ctx.push_token().map(|t| t.value), Some("rotated".to_string()));
    }

    #[tokio::test]
    async fn denied_push_still_initializes() {
        let push = Arc::new(LocalPush::new(Platform::Web, Permission::Denied));
        let ctx = SyncContext::builder(MemoryBus::new(), MemoryHistory::default())
            .push(push)
            .build()
            .unwrap();
        ctx.init().await.unwrap();

        assert!(ctx.is_running());
        assert!(ctx.push_token().is_none());
    }
}
