//! Polls and single-choice voting.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::resource::{Change, VersionedResource};

/// A poll under version control.
pub type Poll = VersionedResource<PollState>;

/// One answer in a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub id: String,
    pub text: String,
    pub vote_count: u32,
    pub voters: BTreeSet<String>,
}

impl PollOption {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            vote_count: 0,
            voters: BTreeSet::new(),
        }
    }
}

/// Poll payload.
///
/// Invariants: `total_votes` is the sum of every `vote_count`, each
/// `vote_count` equals its `voters.len()`, and a user appears in at most one
/// option's voters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollState {
    pub question: String,
    pub options: Vec<PollOption>,
    pub total_votes: u32,
}

impl PollState {
    pub fn new<I, S, T>(question: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            question: question.into(),
            options: options
                .into_iter()
                .map(|(id, text)| PollOption::new(id, text))
                .collect(),
            total_votes: 0,
        }
    }

    pub fn option(&self, option_id: &str) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    /// The option a user currently votes for.
    pub fn voted_option(&self, user_id: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.voters.contains(user_id))
            .map(|o| o.id.as_str())
    }

    /// Check the counting invariants.
    pub fn is_consistent(&self) -> bool {
        let counts_match = self
            .options
            .iter()
            .all(|o| o.vote_count as usize == o.voters.len());
        let sum: u32 = self.options.iter().map(|o| o.vote_count).sum();

        let mut seen = BTreeSet::new();
        let exclusive = self
            .options
            .iter()
            .flat_map(|o| o.voters.iter())
            .all(|u| seen.insert(u));

        counts_match && sum == self.total_votes && exclusive
    }

    fn remove_voter(&mut self, user_id: &str) -> bool {
        let mut removed = false;
        for option in &mut self.options {
            if option.voters.remove(user_id) {
                option.vote_count = option.vote_count.saturating_sub(1);
                removed = true;
            }
        }
        removed
    }

    fn recount(&mut self) {
        self.total_votes = self.options.iter().map(|o| o.vote_count).sum();
    }
}

/// Changes a user can propose to a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PollChange {
    /// Vote for an option, moving any previous vote.
    Vote { option_id: String, user_id: String },
    /// Withdraw the user's vote.
    Unvote { user_id: String },
}

impl PollChange {
    pub fn vote(option_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::Vote {
            option_id: option_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn unvote(user_id: impl Into<String>) -> Self {
        Self::Unvote {
            user_id: user_id.into(),
        }
    }
}

impl Change<PollState> for PollChange {
    fn apply(&self, current: &PollState) -> Result<PollState> {
        let mut next = current.clone();
        match self {
            Self::Vote { option_id, user_id } => {
                if next.option(option_id).is_none() {
                    return Err(ModelError::UnknownOption(option_id.clone()));
                }
                if next.voted_option(user_id) == Some(option_id.as_str()) {
                    return Err(ModelError::AlreadyVoted {
                        user_id: user_id.clone(),
                        option_id: option_id.clone(),
                    });
                }
                next.remove_voter(user_id);
                if let Some(option) = next.options.iter_mut().find(|o| &o.id == option_id) {
                    option.voters.insert(user_id.clone());
                    option.vote_count += 1;
                }
            }
            Self::Unvote { user_id } => {
                if !next.remove_voter(user_id) {
                    return Err(ModelError::NotVoted(user_id.clone()));
                }
            }
        }
        next.recount();
        Ok(next)
    }
}
