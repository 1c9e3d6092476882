use crate::{
    error::{Result, TodoError},
    kv::{KvStore, NOTIFICATION_PERMISSION_KEY},
    relay::{NotificationAction, RelayMessage},
    task::TaskId,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

pub const ACTION_COMPLETE: &str = "complete";
pub const ACTION_DISMISS: &str = "dismiss";

/// Opaque payload identifying the task a notification is about.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    #[serde(default, alias = "todoId", skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
}

impl NotificationData {
    pub fn for_task(id: TaskId) -> Self {
        Self { id: Some(id) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub action: String,
    pub title: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: NotificationData,
    #[serde(default = "default_actions")]
    pub actions: Vec<ActionButton>,
}

fn default_actions() -> Vec<ActionButton> {
    vec![
        ActionButton {
            action: ACTION_COMPLETE.to_string(),
            title: "Mark as done".to_string(),
        },
        ActionButton {
            action: ACTION_DISMISS.to_string(),
            title: "Dismiss".to_string(),
        },
    ]
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>, data: NotificationData) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            data,
            actions: default_actions(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Default,
    Granted,
    Denied,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Default => "default",
            Permission::Granted => "granted",
            Permission::Denied => "denied",
        }
    }

    /// Anything unreadable or unrecognized counts as not yet asked.
    pub fn load(kv: &dyn KvStore) -> Self {
        match kv.get(NOTIFICATION_PERMISSION_KEY) {
            Ok(Some(v)) => match v.as_str() {
                "granted" => Permission::Granted,
                "denied" => Permission::Denied,
                _ => Permission::Default,
            },
            _ => Permission::Default,
        }
    }

    pub fn store(self, kv: &dyn KvStore) -> Result<()> {
        kv.set(NOTIFICATION_PERMISSION_KEY, self.as_str())
    }
}

/// Platform surface that actually puts a notification in front of the user.
pub trait NotificationBackend: Send + Sync {
    fn show(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
pub struct LogBackend;

impl NotificationBackend for LogBackend {
    fn show(&self, n: &Notification) -> anyhow::Result<()> {
        info!(task_id = ?n.data.id, "notification: {} | {}", n.title, n.body);
        Ok(())
    }
}

/// Keeps every shown notification; used by tests.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shown: Arc<Mutex<Vec<Notification>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> Vec<Notification> {
        self.shown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl NotificationBackend for MemoryBackend {
    fn show(&self, n: &Notification) -> anyhow::Result<()> {
        self.shown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(n.clone());
        Ok(())
    }
}

/// Shows notifications when permitted and decodes the user's response.
pub struct Dispatcher {
    kv: Arc<dyn KvStore>,
    backend: Arc<dyn NotificationBackend>,
}

impl Dispatcher {
    pub fn new(kv: Arc<dyn KvStore>, backend: Arc<dyn NotificationBackend>) -> Self {
        Self { kv, backend }
    }

    /// Read from storage on every call; the other process may have changed it.
    pub fn permission(&self) -> Permission {
        Permission::load(self.kv.as_ref())
    }

    pub fn ensure_permission(&self) -> Result<()> {
        match self.permission() {
            Permission::Granted => Ok(()),
            _ => Err(TodoError::PermissionDenied),
        }
    }

    pub fn show(&self, title: &str, body: &str, data: NotificationData) -> bool {
        self.show_notification(&Notification::new(title, body, data))
    }

    /// Returns whether the notification reached the backend. Without permission
    /// this is a no-op; nothing is queued for later.
    pub fn show_notification(&self, notification: &Notification) -> bool {
        if let Err(err) = self.ensure_permission() {
            debug!("notification '{}' dropped: {err}", notification.title);
            return false;
        }
        match self.backend.show(notification) {
            Ok(()) => true,
            Err(err) => {
                error!("showing notification failed: {err}");
                false
            }
        }
    }

    /// Maps a click on a notification to the message an open view should receive.
    ///
    /// `dismiss` is a pure close. A body click, or any action we do not know,
    /// only asks for the view to be brought up.
    pub fn interact(&self, action: Option<&str>, data: &NotificationData) -> Option<RelayMessage> {
        match action.map(str::trim).filter(|a| !a.is_empty()) {
            Some(ACTION_DISMISS) => None,
            Some(ACTION_COMPLETE) => match data.id {
                Some(id) => Some(RelayMessage::complete(id)),
                None => Some(RelayMessage::NotificationAction {
                    action: NotificationAction::Open,
                    todo_id: None,
                }),
            },
            _ => Some(RelayMessage::NotificationAction {
                action: NotificationAction::Open,
                todo_id: data.id,
            }),
        }
    }
}
