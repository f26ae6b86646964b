//! Change notification subscriber.
//!
//! Opens one bus channel (`scope:<id>`) per scope, no matter how many
//! listeners subscribe to it, and fans decoded changes out to every listener.
//! When the bus drops the stream the channel is reopened with capped
//! backoff; listeners are not told, since the buffer absorbs any re-delivered
//! events.
//!
//! A [`Subscription`] stops delivery as soon as it is unsubscribed (or
//! dropped), including for events already being dispatched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tripsync_model::{ChangeKind, StreamEvent, Timestamp};

use crate::buffer::ScopeChange;
use crate::config::BackoffConfig;
use crate::error::{Error, Result};
use crate::lock;
use crate::observe::{Breadcrumb, Level, Observability};
use crate::retry::{Sleep, TokioSleep};

/// Change kinds every scope channel listens for.
pub const ALL_KINDS: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

/// One row change as delivered by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub event_type: ChangeKind,
    pub scope_id: String,
    pub row: Value,
}

impl ChangeRecord {
    pub fn new(event_type: ChangeKind, scope_id: impl Into<String>, row: Value) -> Self {
        Self {
            event_type,
            scope_id: scope_id.into(),
            row,
        }
    }
}

/// External push channel. Delivery is at-least-once and unordered.
pub trait ChangeBus: Send + Sync + 'static {
    /// Open a channel. The stream ends when the transport drops.
    fn open(
        &self,
        channel: &str,
        kinds: &[ChangeKind],
    ) -> BoxFuture<'static, Result<BoxStream<'static, ChangeRecord>>>;
}

/// Bus channel name for a scope.
pub fn channel_name(scope_id: &str) -> String {
    format!("scope:{scope_id}")
}

/// Turn a bus row into a buffer change.
///
/// The row must carry a string `id` and a millisecond `created_at`
/// (`createdAt` is accepted too). The whole row becomes the payload.
pub fn decode_row(record: &ChangeRecord) -> Result<ScopeChange> {
    let row = record
        .row
        .as_object()
        .ok_or_else(|| Error::MalformedRow(format!("row is not an object: {}", record.row)))?;

    let id = row
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::MalformedRow("missing id".into()))?;

    let occurred_at: Timestamp = row
        .get("created_at")
        .or_else(|| row.get("createdAt"))
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::MalformedRow(format!("row {id} has no created_at")))?;

    Ok(ScopeChange {
        kind: record.event_type,
        event: StreamEvent::new(id, record.scope_id.clone(), occurred_at, record.row.clone()),
    })
}

type Callback = Arc<dyn Fn(&ScopeChange) + Send + Sync>;

#[derive(Clone)]
struct Listener {
    active: Arc<AtomicBool>,
    callback: Callback,
}

struct Channel {
    listeners: HashMap<u64, Listener>,
    pump: JoinHandle<()>,
}

trait Registry: Send + Sync {
    fn detach(&self, scope_id: &str, listener_id: u64);
}

struct Inner<B, S> {
    bus: B,
    sleep: S,
    backoff: BackoffConfig,
    observability: Arc<dyn Observability>,
    channels: Mutex<HashMap<String, Channel>>,
    next_id: AtomicU64,
}

impl<B: ChangeBus, S: Sleep> Inner<B, S> {
    fn is_open(&self, scope_id: &str) -> bool {
        lock(&self.channels).contains_key(scope_id)
    }

    fn dispatch(&self, scope_id: &str, record: ChangeRecord) {
        let listeners: Vec<Listener> = match lock(&self.channels).get(scope_id) {
            Some(channel) => channel.listeners.values().cloned().collect(),
            None => return,
        };

        match decode_row(&record) {
            Ok(change) => {
                for listener in listeners {
                    if listener.active.load(Ordering::Acquire) {
                        (listener.callback)(&change);
                    }
                }
            }
            Err(err) => {
                warn!(scope_id, "Dropping undecodable row: {}", err);
                self.observability.add_breadcrumb(
                    Breadcrumb::new("subscriber", "malformed row", Level::Warning)
                        .with("scopeId", scope_id)
                        .with("error", err.to_string()),
                );
            }
        }
    }
}

impl<B: ChangeBus, S: Sleep> Registry for Inner<B, S> {
    fn detach(&self, scope_id: &str, listener_id: u64) {
        let mut channels = lock(&self.channels);
        let Some(channel) = channels.get_mut(scope_id) else {
            return;
        };
        channel.listeners.remove(&listener_id);
        if channel.listeners.is_empty() {
            if let Some(channel) = channels.remove(scope_id) {
                channel.pump.abort();
                debug!(scope_id, "Closed channel");
            }
        }
    }
}

/// Subscribes listeners to per-scope bus channels.
pub struct ScopeSubscriber<B, S: Sleep = TokioSleep> {
    inner: Arc<Inner<B, S>>,
}

impl<B, S: Sleep> Clone for ScopeSubscriber<B, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: ChangeBus> ScopeSubscriber<B, TokioSleep> {
    pub fn new(bus: B, backoff: BackoffConfig, observability: Arc<dyn Observability>) -> Self {
        Self::with_sleep(bus, backoff, observability, TokioSleep)
    }
}

impl<B: ChangeBus, S: Sleep> ScopeSubscriber<B, S> {
    pub fn with_sleep(bus: B, backoff: BackoffConfig, observability: Arc<dyn Observability>, sleep: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                sleep,
                backoff,
                observability,
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn bus(&self) -> &B {
        &self.inner.bus
    }

    /// Call `on_change` for every change in `scope_id` until the returned
    /// subscription is unsubscribed or dropped.
    ///
    /// Fails if the channel cannot be opened; nothing is retried in that case.
    /// Must be called inside a Tokio runtime.
    pub async fn subscribe<F>(&self, scope_id: &str, on_change: F) -> Result<Subscription>
    where
        F: Fn(&ScopeChange) + Send + Sync + 'static,
    {
        let listener_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let listener = Listener {
            active: Arc::new(AtomicBool::new(true)),
            callback: Arc::new(on_change),
        };
        let subscription = self.subscription(scope_id, listener_id, &listener);

        if let Some(channel) = lock(&self.inner.channels).get_mut(scope_id) {
            channel.listeners.insert(listener_id, listener);
            return Ok(subscription);
        }

        let name = channel_name(scope_id);
        let stream = match self.inner.bus.open(&name, &ALL_KINDS).await {
            Ok(stream) => stream,
            Err(err) => {
                subscription.active.store(false, Ordering::Release);
                warn!(scope_id, channel = %name, "Failed to open channel: {}", err);
                self.inner.observability.capture_exception(&err, "channel open");
                return Err(err);
            }
        };

        let mut channels = lock(&self.inner.channels);
        match channels.get_mut(scope_id) {
            // Another subscriber opened it while we were waiting.
            Some(channel) => {
                channel.listeners.insert(listener_id, listener);
            }
            None => {
                let pump = tokio::spawn(pump(Arc::downgrade(&self.inner), scope_id.to_string(), stream));
                channels.insert(
                    scope_id.to_string(),
                    Channel {
                        listeners: HashMap::from([(listener_id, listener)]),
                        pump,
                    },
                );
                info!(scope_id, channel = %name, "Opened channel");
            }
        }
        Ok(subscription)
    }

    fn subscription(&self, scope_id: &str, listener_id: u64, listener: &Listener) -> Subscription {
        let registry: Weak<dyn Registry> = Arc::downgrade(&self.inner) as Weak<dyn Registry>;
        Subscription {
            scope_id: scope_id.to_string(),
            listener_id,
            active: Arc::clone(&listener.active),
            registry,
        }
    }

    /// Open channels.
    pub fn channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    pub fn listener_count(&self, scope_id: &str) -> usize {
        lock(&self.inner.channels)
            .get(scope_id)
            .map_or(0, |c| c.listeners.len())
    }

    /// Close every channel and deactivate every listener.
    pub fn close_all(&self) {
        let channels: Vec<(String, Channel)> = lock(&self.inner.channels).drain().collect();
        for (scope_id, channel) in channels {
            for listener in channel.listeners.values() {
                listener.active.store(false, Ordering::Release);
            }
            channel.pump.abort();
            debug!(scope_id = %scope_id, "Closed channel");
        }
    }
}

async fn pump<B: ChangeBus, S: Sleep>(
    inner: Weak<Inner<B, S>>,
    scope_id: String,
    mut stream: BoxStream<'static, ChangeRecord>,
) {
    loop {
        while let Some(record) = stream.next().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.dispatch(&scope_id, record);
        }

        let mut attempt = 0;
        stream = loop {
            let (sleep, delay) = match inner.upgrade() {
                Some(inner) if inner.is_open(&scope_id) => (inner.sleep.clone(), inner.backoff.duration(attempt)),
                _ => return,
            };
            debug!(scope_id = %scope_id, attempt, delay_ms = delay.as_millis() as u64, "Stream ended, reconnecting");
            sleep.sleep(delay).await;

            let open = match inner.upgrade() {
                Some(inner) if inner.is_open(&scope_id) => inner.bus.open(&channel_name(&scope_id), &ALL_KINDS),
                _ => return,
            };
            match open.await {
                Ok(stream) => {
                    info!(scope_id = %scope_id, attempt, "Reconnected");
                    break stream;
                }
                Err(err) => {
                    warn!(scope_id = %scope_id, attempt, "Reconnect failed: {}", err);
                    attempt += 1;
                }
            }
        };
    }
}

/// Handle for one listener.
pub struct Subscription {
    scope_id: String,
    listener_id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<dyn Registry>,
}

impl Subscription {
    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.scope_id, self.listener_id);
        }
        debug!(scope_id = %self.scope_id, listener_id = self.listener_id, "Unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("scope_id", &self.scope_id)
            .field("listener_id", &self.listener_id)
            .field("active", &self.is_active())
            .finish()
    }
}
