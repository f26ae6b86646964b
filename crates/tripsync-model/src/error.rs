//! Error types for tripsync-model.

use thiserror::Error;

/// Result type for model reducers.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Reasons a proposed change is rejected before it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Message content is empty after trimming whitespace.
    #[error("message content is empty")]
    EmptyContent,

    /// Message content exceeds the maximum length.
    #[error("message content is {len} characters, limit is {max}")]
    ContentTooLong { len: usize, max: usize },

    /// The poll has no option with this id.
    #[error("unknown poll option: {0}")]
    UnknownOption(String),

    /// The user already voted for this option.
    #[error("user {user_id} already voted for {option_id}")]
    AlreadyVoted { user_id: String, option_id: String },

    /// The user has no vote to withdraw.
    #[error("user {0} has not voted")]
    NotVoted(String),

    /// Versions start at 1.
    #[error("invalid version {0}, versions start at 1")]
    InvalidVersion(u64),
}
