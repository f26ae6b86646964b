//! Deduplicating ordered buffer.
//!
//! Holds the hot window of a scope's event stream, always sorted by
//! `(occurred_at, id)` no matter the arrival order. The bus is at-least-once,
//! so ingesting an id that is already present is a no-op.
//!
//! The buffer holds at most `capacity` events. Past that the oldest events are
//! evicted; they stay available through the store's paginated history (see
//! [`ScopeFeed::backfill`](crate::ScopeFeed::backfill)), not from here.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;
use tripsync_model::{ChangeKind, EventKey, StreamEvent, Timestamp};

/// Deleted ids remembered per unit of capacity.
const TOMBSTONES_PER_SLOT: usize = 4;

/// Why an event did not change the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The id is already buffered.
    Duplicate,
    /// Older than the hot window; fetch it through backfill instead.
    BelowWindow,
    /// The id was deleted and must not come back.
    Deleted,
    /// Delete for an id that is not buffered.
    Missing,
    /// The event belongs to another scope.
    OtherScope,
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Newest event, added at the end.
    Appended,
    /// Arrived out of order and was spliced into place.
    Spliced,
    /// Payload of an existing event replaced.
    Updated,
    /// Event removed.
    Removed,
    Dropped(DropReason),
}

impl IngestOutcome {
    pub fn is_applied(self) -> bool {
        !matches!(self, IngestOutcome::Dropped(_))
    }
}

/// A change as delivered for one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeChange {
    pub kind: ChangeKind,
    pub event: StreamEvent,
}

/// Sorted, deduplicated hot window of one scope.
#[derive(Debug)]
pub struct OrderedBuffer {
    scope_id: String,
    capacity: usize,
    entries: Vec<StreamEvent>,
    /// id → occurred_at of every buffered event.
    index: HashMap<String, Timestamp>,
    tombstones: HashSet<String>,
    tombstone_order: VecDeque<String>,
    /// Newest key evicted so far.
    evicted_through: Option<EventKey>,
}

impl OrderedBuffer {
    pub fn new(scope_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            scope_id: scope_id.into(),
            capacity: capacity.max(1),
            entries: Vec::new(),
            index: HashMap::new(),
            tombstones: HashSet::new(),
            tombstone_order: VecDeque::new(),
            evicted_through: None,
        }
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffered events in `(occurred_at, id)` order.
    pub fn events(&self) -> &[StreamEvent] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&StreamEvent> {
        let occurred_at = *self.index.get(id)?;
        self.position(occurred_at, id).ok().map(|i| &self.entries[i])
    }

    /// Key of the oldest buffered event; the cursor for backfill.
    pub fn oldest_cursor(&self) -> Option<EventKey> {
        self.entries.first().map(StreamEvent::key)
    }

    /// Whether older events have been evicted from the hot window.
    pub fn has_evicted(&self) -> bool {
        self.evicted_through.is_some()
    }

    /// Apply a bus change.
    pub fn apply(&mut self, change: ScopeChange) -> IngestOutcome {
        match change.kind {
            ChangeKind::Insert => self.ingest(change.event),
            ChangeKind::Update => self.update(change.event),
            ChangeKind::Delete => self.remove(&change.event.id),
        }
    }

    /// Insert an event unless it is already present.
    pub fn ingest(&mut self, event: StreamEvent) -> IngestOutcome {
        if let Some(reason) = self.reject(&event) {
            trace!(scope_id = %self.scope_id, id = %event.id, ?reason, "Dropped event");
            if reason == DropReason::BelowWindow {
                self.mark_evicted(event.key());
            }
            return IngestOutcome::Dropped(reason);
        }

        let at = match self.position(event.occurred_at, &event.id) {
            Ok(_) => return IngestOutcome::Dropped(DropReason::Duplicate),
            Err(at) => at,
        };
        let appended = at == self.entries.len();

        self.index.insert(event.id.clone(), event.occurred_at);
        self.entries.insert(at, event);
        self.evict_overflow();

        if appended {
            IngestOutcome::Appended
        } else {
            IngestOutcome::Spliced
        }
    }

    /// Replace the payload of a buffered event, or insert it if unknown.
    ///
    /// The event keeps the position of its first delivery.
    pub fn update(&mut self, event: StreamEvent) -> IngestOutcome {
        if event.scope_id != self.scope_id {
            return IngestOutcome::Dropped(DropReason::OtherScope);
        }
        if self.tombstones.contains(&event.id) {
            return IngestOutcome::Dropped(DropReason::Deleted);
        }
        let Some(&occurred_at) = self.index.get(&event.id) else {
            return self.ingest(event);
        };
        match self.position(occurred_at, &event.id) {
            Ok(i) => {
                self.entries[i].payload = event.payload;
                IngestOutcome::Updated
            }
            Err(_) => IngestOutcome::Dropped(DropReason::Missing),
        }
    }

    /// Remove an event and remember its id so late re-deliveries stay dropped.
    pub fn remove(&mut self, id: &str) -> IngestOutcome {
        self.tombstone(id);
        if self.take(id).is_some() {
            IngestOutcome::Removed
        } else {
            IngestOutcome::Dropped(DropReason::Missing)
        }
    }

    /// Swap a locally created entry for its server-confirmed event.
    ///
    /// The confirmed event may already have arrived over the bus, in which case
    /// only the local entry is removed.
    pub fn reconcile(&mut self, local_id: &str, confirmed: StreamEvent) -> IngestOutcome {
        self.take(local_id);
        self.ingest(confirmed)
    }

    /// Drop a locally created entry without tombstoning it.
    pub fn discard(&mut self, local_id: &str) -> Option<StreamEvent> {
        self.take(local_id)
    }

    fn reject(&self, event: &StreamEvent) -> Option<DropReason> {
        if event.scope_id != self.scope_id {
            return Some(DropReason::OtherScope);
        }
        if self.index.contains_key(&event.id) {
            return Some(DropReason::Duplicate);
        }
        if self.tombstones.contains(&event.id) {
            return Some(DropReason::Deleted);
        }
        let below_evicted = self
            .evicted_through
            .as_ref()
            .is_some_and(|w| (event.occurred_at, event.id.as_str()) <= (w.occurred_at, w.id.as_str()));
        if below_evicted {
            return Some(DropReason::BelowWindow);
        }
        if self.entries.len() >= self.capacity {
            let first = &self.entries[0];
            if (event.occurred_at, event.id.as_str()) < (first.occurred_at, first.id.as_str()) {
                return Some(DropReason::BelowWindow);
            }
        }
        None
    }

    fn position(&self, occurred_at: Timestamp, id: &str) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|e| (e.occurred_at, e.id.as_str()).cmp(&(occurred_at, id)))
    }

    fn take(&mut self, id: &str) -> Option<StreamEvent> {
        let occurred_at = self.index.remove(id)?;
        let i = self.position(occurred_at, id).ok()?;
        Some(self.entries.remove(i))
    }

    fn evict_overflow(&mut self) {
        while self.entries.len() > self.capacity {
            let evicted = self.entries.remove(0);
            self.index.remove(&evicted.id);
            trace!(scope_id = %self.scope_id, id = %evicted.id, "Evicted from hot window");
            self.mark_evicted(evicted.key());
        }
    }

    /// Record that history at or below `key` lives outside the hot window.
    fn mark_evicted(&mut self, key: EventKey) {
        if self.evicted_through.as_ref().map_or(true, |w| *w < key) {
            self.evicted_through = Some(key);
        }
    }

    fn tombstone(&mut self, id: &str) {
        if self.tombstones.insert(id.to_string()) {
            self.tombstone_order.push_back(id.to_string());
        }
        while self.tombstone_order.len() > self.capacity * TOMBSTONES_PER_SLOT {
            if let Some(old) = self.tombstone_order.pop_front() {
                self.tombstones.remove(&old);
            }
        }
    }
}
