//! End-to-end flows over the in-memory collaborators.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tripsync_model::{ChangeKind, Message, MessageDraft, Poll, PollChange, PollState, StreamEvent};
use tripsync_sync::chat::PENDING_PREFIX;
use tripsync_sync::memory::{
    MemoryBus, MemoryHistory, MemoryMessageSink, MemoryReactionSink, MemoryStore, RecordingNotifier,
    RecordingSleep,
};
use tripsync_sync::{
    CasOutcome, CasWrite, ChangeRecord, Error, MessageSink, NoticeKind, ResourceSource, SyncConfig,
    SyncContext, VersionedStore,
};

async fn context(bus: MemoryBus, sleep: RecordingSleep) -> SyncContext<MemoryBus, RecordingSleep> {
    let ctx = SyncContext::builder(bus, MemoryHistory::default())
        .config(SyncConfig::default())
        .sleep(sleep)
        .build()
        .unwrap();
    ctx.init().await.unwrap();
    ctx
}

fn lunch_poll() -> Poll {
    Poll::new("poll-1", "trip-1", PollState::new("Lunch?", [("a", "Tacos"), ("b", "Sushi")]))
}

fn is_pending(event: &StreamEvent) -> bool {
    event.id.starts_with(PENDING_PREFIX)
}

/// Message store that holds every reply until released.
struct HeldSink {
    reply: Message,
    release: Arc<Notify>,
}

impl MessageSink for HeldSink {
    async fn send(&self, _draft: &MessageDraft) -> tripsync_sync::Result<Message> {
        self.release.notified().await;
        Ok(self.reply.clone())
    }
}

/// Versioned store that applies a write at once but holds the reply until released.
#[derive(Clone)]
struct HeldStore {
    inner: MemoryStore<PollState>,
    applied: Arc<Notify>,
    release: Arc<Notify>,
}

impl HeldStore {
    fn new(inner: MemoryStore<PollState>) -> Self {
        Self {
            inner,
            applied: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

impl ResourceSource<PollState> for HeldStore {
    async fn fetch(&self, resource_id: &str) -> tripsync_sync::Result<Poll> {
        self.inner.fetch(resource_id).await
    }
}

impl VersionedStore<PollState, PollChange> for HeldStore {
    async fn compare_and_swap(&self, write: &CasWrite<PollChange>) -> tripsync_sync::Result<CasOutcome> {
        let outcome = self.inner.compare_and_swap(write).await;
        self.applied.notify_one();
        self.release.notified().await;
        outcome
    }
}

#[tokio::test]
async fn concurrent_votes_converge_after_refetch() {
    let store = MemoryStore::new();
    store.put(lunch_poll());

    let x = context(MemoryBus::new(), RecordingSleep::default()).await;
    let y = context(MemoryBus::new(), RecordingSleep::default()).await;
    let client_x = x.cas_coordinator(store.clone());
    let client_y = y.cas_coordinator(store.clone());
    client_x.insert(lunch_poll());
    client_y.insert(lunch_poll());

    let version = client_x.mutate("poll-1", 1, PollChange::vote("a", "xena")).await.unwrap();
    assert_eq!(version, 2);

    let err = client_y
        .mutate("poll-1", 1, PollChange::vote("b", "yuri"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { current_version: 2, .. }));
    assert_eq!(client_y.view("poll-1").unwrap().version, 1);
    assert_eq!(store.get("poll-1").unwrap().payload.total_votes, 1);

    let fresh = client_y.refresh("poll-1").await.unwrap();
    assert_eq!(fresh.version, 2);
    let version = client_y.mutate("poll-1", 2, PollChange::vote("b", "yuri")).await.unwrap();
    assert_eq!(version, 3);

    let stored = store.get("poll-1").unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.payload.option("a").unwrap().vote_count, 1);
    assert_eq!(stored.payload.option("b").unwrap().vote_count, 1);
    assert_eq!(stored.payload.total_votes, 2);
    assert!(stored.payload.is_consistent());
    assert_eq!(client_y.view("poll-1").unwrap(), stored);
}

#[tokio::test]
async fn refetch_loop_resolves_conflict() {
    let store = MemoryStore::new();
    store.put(lunch_poll());

    let x = context(MemoryBus::new(), RecordingSleep::default()).await;
    let client_x = x.cas_coordinator(store.clone());
    let client_y = x.cas_coordinator(store.clone());
    client_x.insert(lunch_poll());
    client_y.insert(lunch_poll());

    client_x.mutate("poll-1", 1, PollChange::vote("a", "xena")).await.unwrap();
    let version = client_y
        .mutate_with_refetch("poll-1", PollChange::vote("b", "yuri"))
        .await
        .unwrap();

    assert_eq!(version, 3);
    assert_eq!(store.get("poll-1").unwrap().payload.total_votes, 2);
}

#[tokio::test]
async fn duplicate_delivery_keeps_one_entry() {
    let bus = MemoryBus::new();
    let ctx = context(bus.clone(), RecordingSleep::default()).await;
    let feed = ctx.open_scope("trip-1").await.unwrap();

    let row = json!({"id": "m1", "trip_id": "trip-1", "user_id": "u1", "content": "hi", "created_at": 100});
    bus.publish(ChangeRecord::new(ChangeKind::Insert, "trip-1", row.clone()));
    bus.publish(ChangeRecord::new(ChangeKind::Insert, "trip-1", row));
    bus.publish(ChangeRecord::new(
        ChangeKind::Insert,
        "trip-1",
        json!({"id": "m2", "created_at": 200}),
    ));

    tokio::time::timeout(Duration::from_secs(1), feed.wait_until(|events| events.len() == 2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let ids: Vec<_> = feed.snapshot().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert_eq!(feed.messages()[0].content, "hi");
}

#[tokio::test]
async fn recovers_on_fourth_attempt() {
    let sleep = RecordingSleep::default();
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = SyncContext::builder(MemoryBus::new(), MemoryHistory::default())
        .notifier(notifier.clone())
        .sleep(sleep.clone())
        .build()
        .unwrap();

    let calls = &AtomicU32::new(0);
    let value = ctx
        .retry_policy()
        .execute(move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 4 {
                Err(Error::Network(format!("attempt {n}")))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 4);
    assert_eq!(
        sleep.delays(),
        vec![
            Duration::from_millis(1000),
            Duration::from_millis(2000),
            Duration::from_millis(4000),
        ]
    );
    assert_eq!(sleep.total(), Duration::from_millis(7000));
    assert_eq!(notifier.last().map(|n| n.kind), Some(NoticeKind::Recovered));
}

#[tokio::test]
async fn exhausted_retries_return_last_error() {
    let sleep = RecordingSleep::default();
    let ctx = context(MemoryBus::new(), sleep.clone()).await;

    let calls = &AtomicU32::new(0);
    let err = ctx
        .retry_policy()
        .execute(move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err::<(), _>(Error::Network(format!("attempt {n}")))
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(matches!(err, Error::Network(ref m) if m == "attempt 4"));
    assert_eq!(sleep.delays().len(), 3);
}

#[tokio::test]
async fn exhausted_write_restores_prior_state() {
    let store = MemoryStore::new();
    store.put(lunch_poll());
    for _ in 0..4 {
        store.fail_next(Error::Network("store unreachable".into()));
    }

    let ctx = context(MemoryBus::new(), RecordingSleep::default()).await;
    let client = ctx.cas_coordinator(store.clone());
    client.insert(lunch_poll());
    let before = client.view("poll-1").unwrap();

    let err = client
        .mutate("poll-1", 1, PollChange::vote("a", "xena"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Network(_)));
    assert_eq!(store.cas_calls(), 4);
    assert_eq!(client.view("poll-1").unwrap(), before);
    assert_eq!(store.get("poll-1").unwrap(), lunch_poll());
}

#[tokio::test]
async fn reaction_switch_and_second_user() {
    let sink = MemoryReactionSink::default();
    let ctx = context(MemoryBus::new(), RecordingSleep::default()).await;
    let reactions = ctx.reactions(sink.clone());

    reactions.respond("plan-1", "u1", "coming").unwrap().await.unwrap().unwrap();
    let tally = reactions.tally("plan-1");
    assert_eq!((tally.count("coming"), tally.count("wait")), (1, 0));

    reactions.respond("plan-1", "u1", "wait").unwrap().await.unwrap().unwrap();
    let tally = reactions.tally("plan-1");
    assert_eq!((tally.count("coming"), tally.count("wait")), (0, 1));
    assert_eq!(tally.total(), 1);

    reactions.respond("plan-1", "u2", "coming").unwrap().await.unwrap().unwrap();
    let tally = reactions.tally("plan-1");
    assert_eq!((tally.count("coming"), tally.count("wait")), (1, 1));

    assert!(reactions.respond("plan-1", "u2", "coming").is_none());
    assert_eq!(sink.updates().len(), 3);
}

#[tokio::test]
async fn echo_while_pending_settles_to_one_entry() {
    let bus = MemoryBus::new();
    let ctx = context(bus.clone(), RecordingSleep::default()).await;
    let feed = ctx.open_scope("trip-1").await.unwrap();
    let draft = MessageDraft::new("trip-1", "u1", "Ana", "hello");
    let stored = draft.to_pending("msg-9", 500);
    let release = Arc::new(Notify::new());
    let chat = ctx.chat_sender(HeldSink {
        reply: stored.clone(),
        release: release.clone(),
    });

    let (sent, ()) = tokio::join!(chat.send(&feed, draft), async {
        feed.wait_until(|events| events.iter().any(is_pending)).await;
        bus.publish(ChangeRecord::new(
            ChangeKind::Insert,
            "trip-1",
            serde_json::to_value(&stored).unwrap(),
        ));
        feed.wait_until(|events| events.iter().any(|e| e.id == "msg-9")).await;
        // Echo and placeholder side by side until the send resolves.
        assert_eq!(feed.len(), 2);
        release.notify_one();
    });

    assert_eq!(sent.unwrap().id, "msg-9");
    let ids: Vec<_> = feed.snapshot().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["msg-9"]);
}

#[tokio::test]
async fn senders_sharing_a_feed_keep_each_others_pending_entries() {
    let ctx = context(MemoryBus::new(), RecordingSleep::default()).await;
    let feed = ctx.open_scope("trip-1").await.unwrap();
    let slow_draft = MessageDraft::new("trip-1", "u1", "Ana", "slow");
    let release = Arc::new(Notify::new());
    let slow = ctx.chat_sender(HeldSink {
        reply: slow_draft.to_pending("msg-a", 500),
        release: release.clone(),
    });
    let fast = ctx.chat_sender(MemoryMessageSink::default());

    let (slow_sent, ()) = tokio::join!(slow.send(&feed, slow_draft), async {
        feed.wait_until(|events| events.iter().any(is_pending)).await;
        let fast_sent = fast
            .send(&feed, MessageDraft::new("trip-1", "u2", "Ben", "fast"))
            .await
            .unwrap();

        let snapshot = feed.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(is_pending));
        assert!(snapshot.iter().any(|e| e.id == fast_sent.id));
        release.notify_one();
    });

    assert_eq!(slow_sent.unwrap().id, "msg-a");
    assert_eq!(feed.len(), 2);
    assert!(feed.contains("msg-a"));
    assert!(!feed.snapshot().iter().any(is_pending));
}

#[tokio::test]
async fn newer_copy_during_write_is_kept() {
    let store = MemoryStore::new();
    store.put(lunch_poll());
    let held = HeldStore::new(store.clone());

    let ctx = context(MemoryBus::new(), RecordingSleep::default()).await;
    let client = ctx.cas_coordinator(held.clone());
    let other = ctx.cas_coordinator(store.clone());
    client.insert(lunch_poll());
    other.insert(lunch_poll());

    let (ours, ()) = tokio::join!(client.mutate("poll-1", 1, PollChange::vote("a", "xena")), async {
        held.applied.notified().await;
        // Another client writes on top of ours before our reply arrives.
        let version = other
            .mutate_with_refetch("poll-1", PollChange::vote("b", "yuri"))
            .await
            .unwrap();
        assert_eq!(version, 3);
        assert!(client.observe(store.get("poll-1").unwrap()));
        assert_eq!(client.confirmed("poll-1").unwrap().version, 3);
        held.release.notify_one();
    });

    assert_eq!(ours.unwrap(), 2);
    let view = client.view("poll-1").unwrap();
    assert_eq!(view.version, 3);
    assert_eq!(view.payload.total_votes, 2);
    assert_eq!(view, store.get("poll-1").unwrap());
}

#[tokio::test]
async fn second_write_waits_for_first() {
    let store = MemoryStore::new();
    store.put(lunch_poll());
    let held = HeldStore::new(store.clone());

    let ctx = context(MemoryBus::new(), RecordingSleep::default()).await;
    let client = ctx.cas_coordinator(held.clone());
    client.insert(lunch_poll());

    let (first, ()) = tokio::join!(client.mutate("poll-1", 1, PollChange::vote("a", "xena")), async {
        held.applied.notified().await;
        let err = client
            .mutate_with_refetch("poll-1", PollChange::vote("b", "yuri"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::WritePending { ref resource_id } if resource_id == "poll-1"));
        assert_eq!(store.cas_calls(), 1);
        assert_eq!(client.view("poll-1").unwrap().payload.total_votes, 1);
        held.release.notify_one();
    });

    assert_eq!(first.unwrap(), 2);
    assert_eq!(client.view("poll-1").unwrap(), store.get("poll-1").unwrap());

    held.release.notify_one();
    let version = client
        .mutate_with_refetch("poll-1", PollChange::vote("b", "yuri"))
        .await
        .unwrap();
    assert_eq!(version, 3);
    assert_eq!(store.get("poll-1").unwrap().payload.total_votes, 2);
}
