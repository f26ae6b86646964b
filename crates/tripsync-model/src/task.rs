//! Shared trip tasks.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::Timestamp;
use crate::resource::{Change, VersionedResource};

/// A task under version control.
pub type Task = VersionedResource<TaskState>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub title: String,
    pub completed: bool,
    pub completed_by: Option<String>,
    pub completed_at: Option<Timestamp>,
}

impl TaskState {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            completed: false,
            completed_by: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TaskChange {
    SetCompleted {
        user_id: String,
        completed: bool,
        at: Timestamp,
    },
}

impl TaskChange {
    pub fn complete(user_id: impl Into<String>, at: Timestamp) -> Self {
        Self::SetCompleted {
            user_id: user_id.into(),
            completed: true,
            at,
        }
    }

    pub fn reopen(user_id: impl Into<String>, at: Timestamp) -> Self {
        Self::SetCompleted {
            user_id: user_id.into(),
            completed: false,
            at,
        }
    }
}

impl Change<TaskState> for TaskChange {
    fn apply(&self, current: &TaskState) -> Result<TaskState> {
        let Self::SetCompleted {
            user_id,
            completed,
            at,
        } = self;

        let mut next = current.clone();
        next.completed = *completed;
        if *completed {
            next.completed_by = Some(user_id.clone());
            next.completed_at = Some(*at);
        } else {
            next.completed_by = None;
            next.completed_at = None;
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_then_reopen() {
        let task = Task::new("t1", "trip-1", TaskState::new("Book campsite"));

        let done = task.apply(&TaskChange::complete("u1", 50)).unwrap();
        assert!(done.payload.completed);
        assert_eq!(done.payload.completed_by.as_deref(), Some("u1"));
        assert_eq!(done.version, 2);

        let open = done.apply(&TaskChange::reopen("u2", 60)).unwrap();
        assert!(!open.payload.completed);
        assert_eq!(open.payload.completed_by, None);
        assert_eq!(open.version, 3);
    }

    #[test]
    fn change_fields_are_camel_case() {
        let json = serde_json::to_value(TaskChange::complete("u1", 50)).unwrap();
        assert_eq!(json["type"], "set_completed");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["completed"], true);
        assert!(json.get("user_id").is_none());
    }
}
