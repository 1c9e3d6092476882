//! Shared pieces of the to-do list: the task model, local storage, reminder
//! arithmetic and timers, notification dispatch, and the messages exchanged
//! between the foreground view and the background runner.

pub mod controller;
pub mod error;
pub mod kv;
pub mod notify;
pub mod relay;
pub mod reminder;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod view;

pub use controller::TodoApp;
pub use error::{Result, TodoError};
pub use kv::{KvStore, MemoryKv, SqliteKv};
pub use notify::{Dispatcher, LogBackend, MemoryBackend, Notification, NotificationBackend, NotificationData, Permission};
pub use relay::{NotificationAction, RelayMessage};
pub use reminder::{compute_reminder_times, due_within_window, ReminderTimes};
pub use scheduler::{ArmedTimer, ReminderScheduler, ScheduleOutcome, TimerKind};
pub use store::{load_tasks, TaskStore};
pub use task::{Task, TaskId};
pub use view::{render, Filter, ListItem, ListView};
