//! Error types for tripsync-sync.

use thiserror::Error;
use tripsync_model::{ModelError, Version};

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether retrying the same request can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transience {
    /// Retry will never help without changing inputs or refetching state.
    Permanent,
    /// Retry may help (network blip, collaborator outage).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Errors that can occur while syncing or mutating shared state.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure talking to a collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// The request was rejected as invalid before or by the store.
    #[error("validation failed: {0}")]
    Validation(#[from] ModelError),

    /// A client-side rate limit rejected the request. No network attempt was made.
    #[error("rate limit exceeded for {key}")]
    RateLimited { key: String },

    /// Compare-and-swap rejected a write against a stale version.
    #[error("version conflict on {resource_id}: expected {expected_version}, current {current_version}")]
    Conflict {
        resource_id: String,
        expected_version: Version,
        current_version: Version,
    },

    /// A write to the same resource is still waiting for the store.
    #[error("write to {resource_id} already in flight")]
    WritePending { resource_id: String },

    /// The session is not authorized for the request.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Failure that could not be classified.
    #[error("unexpected error: {0}")]
    Unknown(String),

    /// A change-bus channel could not be opened.
    #[error("failed to open channel {channel}: {reason}")]
    Subscription { channel: String, reason: String },

    /// A bus row did not carry the fields an event needs.
    #[error("malformed row: {0}")]
    MalformedRow(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The owning sync context has been disposed.
    #[error("sync context has been disposed")]
    Disposed,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Classify the error for the retry engine.
    pub fn transience(&self) -> Transience {
        match self {
            Error::Network(_) | Error::Unknown(_) | Error::Subscription { .. } => {
                Transience::Retryable
            }
            Error::Validation(_)
            | Error::RateLimited { .. }
            | Error::Conflict { .. }
            | Error::WritePending { .. }
            | Error::Authentication(_)
            | Error::MalformedRow(_)
            | Error::NotFound(_)
            | Error::Disposed
            | Error::Config(_)
            | Error::Serialization(_) => Transience::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.transience().is_retryable()
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Short machine-readable tag, used in breadcrumbs and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Network(_) => "network",
            Error::Validation(_) => "validation",
            Error::RateLimited { .. } => "rate_limited",
            Error::Conflict { .. } => "conflict",
            Error::WritePending { .. } => "write_pending",
            Error::Authentication(_) => "authentication",
            Error::Unknown(_) => "unknown",
            Error::Subscription { .. } => "subscription",
            Error::MalformedRow(_) => "malformed_row",
            Error::NotFound(_) => "not_found",
            Error::Disposed => "disposed",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
        }
    }
}
