//! Tripsync simulator
//!
//! Runs two clients against in-memory collaborators and logs what each sees:
//! chat with duplicate delivery, a contested poll vote, a shared task and
//! reactions.

use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tripsync_model::{ChangeKind, MessageDraft, Poll, PollChange, PollState, Task, TaskChange, TaskState};
use tripsync_sync::chat::now_millis;
use tripsync_sync::memory::{MemoryBus, MemoryHistory, MemoryMessageSink, MemoryReactionSink, MemoryStore};
use tripsync_sync::{ChangeRecord, Error, SyncConfig, SyncContext};

const TRIP: &str = "trip-demo";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tripsync_sim=info,tripsync_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncConfig::from_env()?;
    info!(?config, "Starting simulation");

    let bus = MemoryBus::new();
    let history = MemoryHistory::default();
    let alice = SyncContext::builder(bus.clone(), history.clone())
        .config(config.clone())
        .build()?;
    let bruno = SyncContext::builder(bus.clone(), history)
        .config(config)
        .build()?;
    alice.init().await?;
    bruno.init().await?;

    chat(&alice, &bruno, &bus).await?;
    poll(&alice, &bruno).await?;
    task(&alice, &bruno).await?;
    reactions(&alice).await?;

    alice.dispose();
    bruno.dispose();
    info!("Simulation finished");
    Ok(())
}

async fn chat(
    alice: &SyncContext<MemoryBus>,
    bruno: &SyncContext<MemoryBus>,
    bus: &MemoryBus,
) -> Result<(), Box<dyn std::error::Error>> {
    let alice_feed = alice.open_scope(TRIP).await?;
    let bruno_feed = bruno.open_scope(TRIP).await?;
    let sink = MemoryMessageSink::default();
    let sender = alice.chat_sender(sink);

    let message = sender
        .send(&alice_feed, MessageDraft::new(TRIP, "alice", "Alice", "Train leaves at 8"))
        .await?;

    // The store echoes each insert, and the network delivers one of them twice.
    let row = serde_json::to_value(&message)?;
    for _ in 0..2 {
        bus.publish(ChangeRecord::new(ChangeKind::Insert, TRIP, row.clone()));
    }
    tokio::time::timeout(
        Duration::from_secs(1),
        bruno_feed.wait_until(|events| !events.is_empty()),
    )
    .await?;

    info!(
        alice = alice_feed.len(),
        bruno = bruno_feed.len(),
        content = %message.content,
        "Chat delivered"
    );
    Ok(())
}

async fn poll(
    alice: &SyncContext<MemoryBus>,
    bruno: &SyncContext<MemoryBus>,
) -> Result<(), Box<dyn std::error::Error>> {
    let initial = Poll::new(
        "poll-dinner",
        TRIP,
        PollState::new("Dinner?", [("tapas", "Tapas"), ("ramen", "Ramen")]),
    );
    let store = MemoryStore::new();
    store.put(initial.clone());

    let alice_polls = alice.cas_coordinator(store.clone());
    let bruno_polls = bruno.cas_coordinator(store.clone());
    alice_polls.insert(initial.clone());
    bruno_polls.insert(initial);

    let version = alice_polls
        .mutate("poll-dinner", 1, PollChange::vote("tapas", "alice"))
        .await?;
    info!(version, "Alice voted");

    match bruno_polls
        .mutate("poll-dinner", 1, PollChange::vote("ramen", "bruno"))
        .await
    {
        Err(Error::Conflict { current_version, .. }) => {
            warn!(current_version, "Bruno's vote raced Alice's, refetching");
            let version = bruno_polls
                .mutate_with_refetch("poll-dinner", PollChange::vote("ramen", "bruno"))
                .await?;
            info!(version, "Bruno voted");
        }
        other => {
            other?;
        }
    }

    if let Some(stored) = store.get("poll-dinner") {
        info!(
            version = stored.version,
            total_votes = stored.payload.total_votes,
            consistent = stored.payload.is_consistent(),
            "Poll settled"
        );
    }
    Ok(())
}

async fn task(
    alice: &SyncContext<MemoryBus>,
    bruno: &SyncContext<MemoryBus>,
) -> Result<(), Box<dyn std::error::Error>> {
    let initial = Task::new("task-tickets", TRIP, TaskState::new("Book museum tickets"));
    let store = MemoryStore::new();
    store.put(initial.clone());

    let alice_tasks = alice.cas_coordinator(store.clone());
    let bruno_tasks = bruno.cas_coordinator(store.clone());
    alice_tasks.insert(initial.clone());
    bruno_tasks.insert(initial);

    alice_tasks
        .mutate_with_refetch("task-tickets", TaskChange::complete("alice", now_millis()))
        .await?;
    let latest = bruno_tasks.refresh("task-tickets").await?;
    info!(
        version = latest.version,
        completed_by = ?latest.payload.completed_by,
        "Task seen by Bruno"
    );
    Ok(())
}

async fn reactions(alice: &SyncContext<MemoryBus>) -> Result<(), Box<dyn std::error::Error>> {
    let board = alice.reactions(MemoryReactionSink::default());

    for (user, kind) in [("alice", "coming"), ("alice", "wait"), ("bruno", "coming")] {
        if let Some(handle) = board.respond("plan-hike", user, kind) {
            handle.await??;
        }
    }

    let tally = board.tally("plan-hike");
    info!(
        coming = tally.count("coming"),
        wait = tally.count("wait"),
        total = tally.total(),
        "Reactions settled"
    );
    Ok(())
}
