//! Messages exchanged between an open view and the background runner.

use crate::task::{Task, TaskId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
    Complete,
    Dismiss,
    /// Body click without choosing an action button.
    Open,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayMessage {
    NotificationAction {
        action: NotificationAction,
        #[serde(
            rename = "todoId",
            alias = "taskId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        todo_id: Option<TaskId>,
    },
    ScheduleNotification {
        task: Task,
    },
}

impl RelayMessage {
    pub fn complete(id: TaskId) -> Self {
        RelayMessage::NotificationAction {
            action: NotificationAction::Complete,
            todo_id: Some(id),
        }
    }

    pub fn schedule(task: Task) -> Self {
        RelayMessage::ScheduleNotification { task }
    }
}
