//! In-memory collaborators.
//!
//! Stand-ins for the change bus, the store and the diagnostic channels, for
//! tests and the local simulator. Each one is cheap to clone; clones share
//! state, so a test can keep a handle to inspect what the core did.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::trace;
use tripsync_model::{Change, ChangeKind, EventKey, Message, MessageDraft, StreamEvent, VersionedResource};

use crate::cas::{CasOutcome, CasWrite, ResourceSource, VersionedStore};
use crate::chat::{now_millis, MessageSink};
use crate::context::HistorySource;
use crate::error::{Error, Result};
use crate::lock;
use crate::observe::{Breadcrumb, Notice, Notifier, Observability};
use crate::push::{
    NotificationHandler, Permission, Platform, PushCapability, PushNotification, PushToken, TokenHandler,
};
use crate::reactions::{ReactionSink, ReactionUpdate};
use crate::retry::Sleep;
use crate::subscriber::{channel_name, ChangeBus, ChangeRecord};

const BUS_CAPACITY: usize = 1024;

#[derive(Default)]
struct BusState {
    channels: HashMap<String, broadcast::Sender<ChangeRecord>>,
    opens: HashMap<String, usize>,
    failing_opens: usize,
}

/// Broadcast-backed change bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a record to its scope channel. Returns how many streams got it.
    pub fn publish(&self, record: ChangeRecord) -> usize {
        let name = channel_name(&record.scope_id);
        match lock(&self.state).channels.get(&name) {
            Some(sender) => sender.send(record).unwrap_or(0),
            None => 0,
        }
    }

    /// End every open stream on `channel`, as a transport drop would.
    pub fn drop_connections(&self, channel: &str) {
        lock(&self.state).channels.remove(channel);
    }

    /// Times `channel` has been opened.
    pub fn opens(&self, channel: &str) -> usize {
        lock(&self.state).opens.get(channel).copied().unwrap_or(0)
    }

    /// Make the next open fail.
    pub fn fail_next_open(&self) {
        lock(&self.state).failing_opens += 1;
    }
}

impl ChangeBus for MemoryBus {
    fn open(&self, channel: &str, kinds: &[ChangeKind]) -> BoxFuture<'static, Result<BoxStream<'static, ChangeRecord>>> {
        let mut state = lock(&self.state);
        *state.opens.entry(channel.to_string()).or_default() += 1;

        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            let err = Error::Subscription {
                channel: channel.to_string(),
                reason: "injected failure".into(),
            };
            return future::ready(Err(err)).boxed();
        }

        let receiver = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .subscribe();
        let kinds = kinds.to_vec();

        let records = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(record) => return Some((record, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!(skipped, "Bus receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |record| future::ready(kinds.contains(&record.event_type)))
        .boxed();

        future::ready(Ok(records)).boxed()
    }
}

/// Paginated history over a fixed event set.
#[derive(Clone, Default)]
pub struct MemoryHistory {
    events: Arc<Mutex<HashMap<String, Vec<StreamEvent>>>>,
}

impl MemoryHistory {
    pub fn insert(&self, event: StreamEvent) {
        lock(&self.events)
            .entry(event.scope_id.clone())
            .or_default()
            .push(event);
    }
}

impl HistorySource for MemoryHistory {
    fn fetch_before(
        &self,
        scope_id: &str,
        before: Option<&EventKey>,
        limit: usize,
    ) -> BoxFuture<'static, Result<Vec<StreamEvent>>> {
        let mut older: Vec<StreamEvent> = lock(&self.events)
            .get(scope_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| before.map_or(true, |b| e.key() < *b))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        older.sort_by_key(StreamEvent::key);
        if older.len() > limit {
            older.drain(..older.len() - limit);
        }
        future::ready(Ok(older)).boxed()
    }
}

struct StoreState<T> {
    resources: HashMap<String, VersionedResource<T>>,
    failures: VecDeque<Error>,
    cas_calls: usize,
}

/// Versioned store enforcing compare-and-swap.
pub struct MemoryStore<T> {
    state: Arc<Mutex<StoreState<T>>>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                resources: HashMap::new(),
                failures: VecDeque::new(),
                cas_calls: 0,
            })),
        }
    }
}

impl<T: Clone> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, resource: VersionedResource<T>) {
        lock(&self.state).resources.insert(resource.id.clone(), resource);
    }

    pub fn get(&self, resource_id: &str) -> Option<VersionedResource<T>> {
        lock(&self.state).resources.get(resource_id).cloned()
    }

    /// Fail the next CAS call with `error`. Calls queue up.
    pub fn fail_next(&self, error: Error) {
        lock(&self.state).failures.push_back(error);
    }

    /// CAS calls received, including failed ones.
    pub fn cas_calls(&self) -> usize {
        lock(&self.state).cas_calls
    }
}

impl<T: Clone + Send + Sync + 'static> ResourceSource<T> for MemoryStore<T> {
    async fn fetch(&self, resource_id: &str) -> Result<VersionedResource<T>> {
        self.get(resource_id)
            .ok_or_else(|| Error::NotFound(resource_id.to_string()))
    }
}

impl<T, C> VersionedStore<T, C> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
    C: Change<T> + Sync,
{
    async fn compare_and_swap(&self, write: &CasWrite<C>) -> Result<CasOutcome> {
        let mut state = lock(&self.state);
        state.cas_calls += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let current = state
            .resources
            .get(&write.resource_id)
            .ok_or_else(|| Error::NotFound(write.resource_id.clone()))?;
        if !current.accepts(write.expected_version) {
            return Ok(CasOutcome::Conflict {
                current_version: current.version,
            });
        }

        let next = current.apply(&write.change)?;
        let new_version = next.version;
        state.resources.insert(next.id.clone(), next);
        Ok(CasOutcome::Applied { new_version })
    }
}

struct SinkState<T> {
    accepted: Vec<T>,
    failures: VecDeque<Error>,
}

impl<T> Default for SinkState<T> {
    fn default() -> Self {
        Self {
            accepted: Vec::new(),
            failures: VecDeque::new(),
        }
    }
}

impl<T> SinkState<T> {
    fn next_failure(&mut self) -> Result<()> {
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Message store assigning `msg-<n>` ids.
#[derive(Clone, Default)]
pub struct MemoryMessageSink {
    state: Arc<Mutex<SinkState<Message>>>,
}

impl MemoryMessageSink {
    /// Messages stored so far.
    pub fn sent(&self) -> Vec<Message> {
        lock(&self.state).accepted.clone()
    }

    pub fn fail_next(&self, error: Error) {
        lock(&self.state).failures.push_back(error);
    }
}

impl MessageSink for MemoryMessageSink {
    async fn send(&self, draft: &MessageDraft) -> Result<Message> {
        let mut state = lock(&self.state);
        state.next_failure()?;
        let id = format!("msg-{}", state.accepted.len() + 1);
        let message = draft.to_pending(id, now_millis());
        state.accepted.push(message.clone());
        Ok(message)
    }
}

/// Reaction store recording every accepted update.
#[derive(Clone, Default)]
pub struct MemoryReactionSink {
    state: Arc<Mutex<SinkState<ReactionUpdate>>>,
}

impl MemoryReactionSink {
    pub fn updates(&self) -> Vec<ReactionUpdate> {
        lock(&self.state).accepted.clone()
    }

    pub fn fail_next(&self, error: Error) {
        lock(&self.state).failures.push_back(error);
    }
}

impl ReactionSink for MemoryReactionSink {
    async fn sync(&self, update: &ReactionUpdate) -> Result<()> {
        let mut state = lock(&self.state);
        state.next_failure()?;
        state.accepted.push(update.clone());
        Ok(())
    }
}

/// Keeps breadcrumbs and captured errors for inspection.
#[derive(Default)]
pub struct RecordingObservability {
    breadcrumbs: Mutex<Vec<Breadcrumb>>,
    exceptions: Mutex<Vec<(String, String)>>,
}

impl RecordingObservability {
    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        lock(&self.breadcrumbs).clone()
    }

    /// `(error message, context)` pairs.
    pub fn exceptions(&self) -> Vec<(String, String)> {
        lock(&self.exceptions).clone()
    }
}

impl Observability for RecordingObservability {
    fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
        lock(&self.breadcrumbs).push(breadcrumb);
    }

    fn capture_exception(&self, error: &Error, context: &str) {
        lock(&self.exceptions).push((error.to_string(), context.to_string()));
    }
}

/// Keeps user-facing notices for inspection.
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        lock(&self.notices).clone()
    }

    pub fn last(&self) -> Option<Notice> {
        lock(&self.notices).last().cloned()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        lock(&self.notices).push(notice);
    }
}

/// Records requested delays and returns without waiting.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleep {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleep {
    pub fn delays(&self) -> Vec<Duration> {
        lock(&self.delays).clone()
    }

    /// Sum of all requested delays.
    pub fn total(&self) -> Duration {
        lock(&self.delays).iter().sum()
    }
}

impl Sleep for RecordingSleep {
    async fn sleep(&self, duration: Duration) {
        lock(&self.delays).push(duration);
        tokio::task::yield_now().await;
    }
}

/// Push capability that registers locally and lets tests deliver notifications.
pub struct LocalPush {
    platform: Platform,
    permission: Permission,
    token: Mutex<Option<PushToken>>,
    notification_handlers: Mutex<Vec<NotificationHandler>>,
    token_handlers: Mutex<Vec<TokenHandler>>,
}

impl LocalPush {
    pub fn new(platform: Platform, permission: Permission) -> Self {
        Self {
            platform,
            permission,
            token: Mutex::new(None),
            notification_handlers: Mutex::new(Vec::new()),
            token_handlers: Mutex::new(Vec::new()),
        }
    }

    /// Hand a notification to every registered handler.
    pub fn deliver(&self, notification: &PushNotification) {
        let handlers = lock(&self.notification_handlers).clone();
        for handler in handlers {
            handler(notification);
        }
    }

    /// Rotate the token and tell every registered handler.
    pub fn refresh_token(&self, value: &str) {
        let token = PushToken {
            platform: self.platform,
            value: value.to_string(),
        };
        *lock(&self.token) = Some(token.clone());
        let handlers = lock(&self.token_handlers).clone();
        for handler in handlers {
            handler(&token);
        }
    }
}

impl PushCapability for LocalPush {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn request_permission(&self) -> BoxFuture<'_, Result<Permission>> {
        future::ready(Ok(self.permission)).boxed()
    }

    fn register(&self) -> BoxFuture<'_, Result<PushToken>> {
        let result = if self.permission == Permission::Granted {
            let token = PushToken {
                platform: self.platform,
                value: format!("{}-local-token", self.platform),
            };
            *lock(&self.token) = Some(token.clone());
            Ok(token)
        } else {
            Err(Error::Authentication("push permission not granted".into()))
        };
        future::ready(result).boxed()
    }

    fn on_notification(&self, handler: NotificationHandler) {
        lock(&self.notification_handlers).push(handler);
    }

    fn on_token_refresh(&self, handler: TokenHandler) {
        lock(&self.token_handlers).push(handler);
    }
}
