//! Tripsync Model - shared trip state as it travels over the wire.
//!
//! Every type here mirrors a row the backing store owns. The store creates and
//! mutates them; clients only observe events and propose changes. Proposals
//! are expressed as pure reducers so a client can apply them to its cached
//! copy optimistically and discard the result if the store disagrees.
//!
//! # Contents
//!
//! - **Events**: [`StreamEvent`] and its ordering key [`EventKey`]
//! - **Messages**: chat [`Message`]s and content validation
//! - **Versioned resources**: [`VersionedResource`] with [`Change`] reducers
//!   for [`PollState`] and [`TaskState`]
//! - **Reactions**: mutually exclusive per-user [`Reaction`]s and the
//!   [`ReactionBoard`] that keeps their [`ReactionTally`] consistent
//!
//! # Example
//!
//! ```
//! use tripsync_model::{Poll, PollChange, PollState};
//!
//! let poll = Poll::new("p1", "trip-1", PollState::new("Dinner?", [("a", "Tacos"), ("b", "Sushi")]));
//! let voted = poll.apply(&PollChange::vote("a", "alice")).unwrap();
//!
//! assert_eq!(voted.version, 2);
//! assert_eq!(voted.payload.total_votes, 1);
//! ```

pub mod error;
pub mod event;
pub mod message;
pub mod poll;
pub mod reaction;
pub mod resource;
pub mod task;

pub use error::{ModelError, Result};
pub use event::{ChangeKind, EventKey, StreamEvent, Timestamp};
pub use message::{validate_content, Message, MessageDraft, MAX_CONTENT_LEN};
pub use poll::{Poll, PollChange, PollOption, PollState};
pub use reaction::{Reaction, ReactionBoard, ReactionTally};
pub use resource::{Change, Version, VersionedResource};
pub use task::{Task, TaskChange, TaskState};
