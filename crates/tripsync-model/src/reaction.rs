//! Mutually exclusive per-user reactions and their tallies.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// A user's active reaction to a subject (a broadcast, a message).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub subject_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Reaction {
    pub fn new(
        subject_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            user_id: user_id.into(),
            kind: kind.into(),
        }
    }
}

/// Per-type counters for one subject.
///
/// A type that has been used keeps its entry at zero, so a switch from
/// `coming` to `wait` reads `{coming: 0, wait: 1}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionTally {
    pub subject_id: String,
    pub counts: BTreeMap<String, u32>,
}

impl ReactionTally {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            counts: BTreeMap::new(),
        }
    }

    pub fn count(&self, kind: &str) -> u32 {
        self.counts.get(kind).copied().unwrap_or(0)
    }

    /// Number of users with an active reaction.
    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    fn increment(&mut self, kind: &str) {
        *self.counts.entry(kind.to_string()).or_insert(0) += 1;
    }

    fn decrement(&mut self, kind: &str) {
        let count = self.counts.entry(kind.to_string()).or_insert(0);
        *count = count.saturating_sub(1);
    }
}

/// Active reactions for one subject together with their tally.
///
/// The tally is only ever changed through [`ReactionBoard::set`], which keeps
/// `tally.total()` equal to the number of users with an active reaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactionBoard {
    active: HashMap<String, String>,
    tally: ReactionTally,
}

impl ReactionBoard {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            active: HashMap::new(),
            tally: ReactionTally::new(subject_id),
        }
    }

    /// Build a board from an authoritative reaction list.
    ///
    /// Reactions for other subjects are ignored; a later entry for the same
    /// user replaces an earlier one.
    pub fn from_reactions<'a>(
        subject_id: impl Into<String>,
        reactions: impl IntoIterator<Item = &'a Reaction>,
    ) -> Self {
        let mut board = Self::new(subject_id);
        for reaction in reactions {
            if reaction.subject_id == board.tally.subject_id {
                board.set(&reaction.user_id, Some(reaction.kind.as_str()));
            }
        }
        board
    }

    pub fn subject_id(&self) -> &str {
        &self.tally.subject_id
    }

    pub fn tally(&self) -> &ReactionTally {
        &self.tally
    }

    pub fn active(&self, user_id: &str) -> Option<&str> {
        self.active.get(user_id).map(String::as_str)
    }

    /// Number of users with an active reaction.
    pub fn responders(&self) -> usize {
        self.active.len()
    }

    /// Set or clear a user's reaction. Returns the previous reaction.
    ///
    /// Switching type moves one count from the old type to the new one, so the
    /// tally total only changes when a user starts or stops reacting.
    pub fn set(&mut self, user_id: &str, kind: Option<&str>) -> Option<String> {
        let previous = match kind {
            Some(kind) => self.active.insert(user_id.to_string(), kind.to_string()),
            None => self.active.remove(user_id),
        };
        if let Some(old) = &previous {
            self.tally.decrement(old);
        }
        if let Some(new) = kind {
            self.tally.increment(new);
        }
        previous
    }
}
