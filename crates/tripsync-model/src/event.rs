//! Stream events delivered by the change bus.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Kind of row change reported by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Ordering key within a scope.
///
/// Field order matters: the derived `Ord` compares `occurred_at` first and
/// falls back to `id` for equal timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub occurred_at: Timestamp,
    pub id: String,
}

impl EventKey {
    pub fn new(occurred_at: Timestamp, id: impl Into<String>) -> Self {
        Self {
            occurred_at,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.occurred_at)
    }
}

/// A uniquely identified event inside one scope (trip).
///
/// `id` is unique within `scope_id`; a second delivery with the same `id` is
/// the same event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent<P = serde_json::Value> {
    pub id: String,
    pub scope_id: String,
    pub occurred_at: Timestamp,
    pub payload: P,
}

impl<P> StreamEvent<P> {
    pub fn new(
        id: impl Into<String>,
        scope_id: impl Into<String>,
        occurred_at: Timestamp,
        payload: P,
    ) -> Self {
        Self {
            id: id.into(),
            scope_id: scope_id.into(),
            occurred_at,
            payload,
        }
    }

    /// The `(occurred_at, id)` ordering key.
    pub fn key(&self) -> EventKey {
        EventKey::new(self.occurred_at, self.id.clone())
    }

    /// Replace the payload, keeping identity and position.
    pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> StreamEvent<Q> {
        StreamEvent {
            id: self.id,
            scope_id: self.scope_id,
            occurred_at: self.occurred_at,
            payload: f(self.payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_orders_by_time_then_id() {
        let a = EventKey::new(100, "b");
        let b = EventKey::new(100, "c");
        let c = EventKey::new(99, "z");

        let mut keys = vec![a.clone(), b.clone(), c.clone()];
        keys.sort();
        assert_eq!(keys, vec![c, a, b]);
    }

    #[test]
    fn event_uses_camel_case_on_the_wire() {
        let event = StreamEvent::new("m1", "trip-1", 42, serde_json::json!({"content": "hi"}));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["scopeId"], "trip-1");
        assert_eq!(json["occurredAt"], 42);
    }

    #[test]
    fn change_kind_display() {
        assert_eq!(ChangeKind::Insert.to_string(), "insert");
        assert_eq!(ChangeKind::Update.to_string(), "update");
        assert_eq!(ChangeKind::Delete.to_string(), "delete");
    }
}
