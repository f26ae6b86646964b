//! Chat messages.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::event::{EventKey, StreamEvent, Timestamp};

/// Maximum message length in characters.
pub const MAX_CONTENT_LEN: usize = 4000;

/// A chat message as stored by the backend.
///
/// Ordered by `(created_at, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default, alias = "scope_id", alias = "trip_id")]
    pub scope_id: String,
    pub content: String,
    #[serde(alias = "author_id", alias = "user_id")]
    pub author_id: String,
    #[serde(default, alias = "author_name")]
    pub author_name: String,
    #[serde(default, alias = "created_at")]
    pub created_at: Timestamp,
}

impl Message {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.created_at, self.id.clone())
    }

    /// Wrap as a stream event with a JSON payload.
    pub fn to_event(&self) -> StreamEvent {
        let payload = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        StreamEvent::new(self.id.clone(), self.scope_id.clone(), self.created_at, payload)
    }

    /// Decode a message from a stream event payload.
    ///
    /// Accepts both the camelCase wire form and raw snake_case rows. Identity
    /// and timestamp always come from the event itself.
    pub fn from_event(event: &StreamEvent) -> Option<Self> {
        let mut message: Self = serde_json::from_value(event.payload.clone()).ok()?;
        message.id.clone_from(&event.id);
        message.scope_id.clone_from(&event.scope_id);
        message.created_at = event.occurred_at;
        Some(message)
    }
}

/// A message the user is about to send. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    pub scope_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
}

impl MessageDraft {
    pub fn new(
        scope_id: impl Into<String>,
        author_id: impl Into<String>,
        author_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            scope_id: scope_id.into(),
            author_id: author_id.into(),
            author_name: author_name.into(),
            content: content.into(),
        }
    }

    /// Validate and trim the content in place.
    pub fn validate(mut self) -> Result<Self> {
        self.content = validate_content(&self.content)?.to_string();
        Ok(self)
    }

    /// Materialize the draft under a local id, before the store confirms it.
    pub fn to_pending(&self, id: impl Into<String>, created_at: Timestamp) -> Message {
        Message {
            id: id.into(),
            scope_id: self.scope_id.clone(),
            content: self.content.clone(),
            author_id: self.author_id.clone(),
            author_name: self.author_name.clone(),
            created_at,
        }
    }
}

/// Check message content, returning it trimmed.
pub fn validate_content(content: &str) -> Result<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ModelError::EmptyContent);
    }
    let len = trimmed.chars().count();
    if len > MAX_CONTENT_LEN {
        return Err(ModelError::ContentTooLong {
            len,
            max: MAX_CONTENT_LEN,
        });
    }
    Ok(trimmed)
}
