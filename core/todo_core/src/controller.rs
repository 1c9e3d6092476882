use crate::{
    error::Result,
    kv::KvStore,
    notify::{Dispatcher, NotificationBackend, NotificationData, Permission},
    relay::{NotificationAction, RelayMessage},
    scheduler::{ArmedTimer, ReminderScheduler, ScheduleOutcome},
    store::TaskStore,
    task::{Task, TaskId},
    view::{render, Filter, ListView},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

pub const PERMISSION_ADVISORY: &str =
    "Without notifications we cannot remind you of your tasks on time.";

/// The view's state: task list, reminder timers and the active filter.
///
/// Every mutation persists first and then rebuilds the reminder timers from
/// the saved list before returning. Must live inside a tokio runtime.
pub struct TodoApp {
    store: TaskStore,
    scheduler: ReminderScheduler,
    dispatcher: Arc<Dispatcher>,
    filter: Filter,
    local_reminders: bool,
}

impl TodoApp {
    pub fn new(kv: Arc<dyn KvStore>, backend: Arc<dyn NotificationBackend>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(kv.clone(), backend));
        let scheduler = ReminderScheduler::new(kv.clone(), dispatcher.clone());
        Self {
            store: TaskStore::load(kv),
            scheduler,
            dispatcher,
            filter: Filter::All,
            local_reminders: true,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }

    pub fn view(&self) -> ListView {
        render(self.store.tasks(), self.filter)
    }

    pub fn armed_timers(&self) -> Vec<ArmedTimer> {
        self.scheduler.armed()
    }

    /// Arms reminders for everything already stored.
    pub fn start(&mut self) -> usize {
        self.reschedule()
    }

    /// Switches this process's own reminder timers on or off. They are off
    /// while the background runner holds every dated task, so each reminder is
    /// shown once. Returns the number of timers armed.
    pub fn set_local_reminders(&mut self, on: bool) -> usize {
        self.local_reminders = on;
        self.reschedule()
    }

    pub fn local_reminders(&self) -> bool {
        self.local_reminders
    }

    pub fn add(&mut self, text: &str, due_date: Option<DateTime<Utc>>) -> Result<Option<Task>> {
        let added = self.store.add(text, due_date)?;
        if added.is_some() {
            self.reschedule();
        }
        Ok(added)
    }

    pub fn toggle(&mut self, id: TaskId) -> Result<bool> {
        let found = self.store.toggle(id)?;
        self.reschedule();
        Ok(found)
    }

    pub fn complete(&mut self, id: TaskId) -> Result<bool> {
        let found = self.store.complete(id)?;
        self.reschedule();
        Ok(found)
    }

    pub fn delete(&mut self, id: TaskId) -> Result<bool> {
        let found = self.store.delete(id)?;
        self.reschedule();
        Ok(found)
    }

    pub fn clear_completed(&mut self) -> Result<usize> {
        let removed = self.store.clear_completed()?;
        self.reschedule();
        Ok(removed)
    }

    pub fn set_filter(&mut self, filter: Filter) -> ListView {
        self.filter = filter;
        self.view()
    }

    /// Applies a message relayed from the background runner. Returns true if
    /// the task list changed.
    pub fn handle_relay(&mut self, msg: RelayMessage) -> Result<bool> {
        match msg {
            RelayMessage::NotificationAction {
                action: NotificationAction::Complete,
                todo_id: Some(id),
            } => {
                let found = self.complete(id)?;
                if !found {
                    warn!(task_id = %id, "complete action for unknown task");
                }
                Ok(found)
            }
            RelayMessage::NotificationAction { .. } => Ok(false),
            RelayMessage::ScheduleNotification { .. } if !self.local_reminders => Ok(false),
            RelayMessage::ScheduleNotification { task } => {
                if let ScheduleOutcome::Armed(n) = self.scheduler.schedule_task(&task, Utc::now()) {
                    info!(task_id = %task.id, "armed {n} reminder timers");
                }
                Ok(false)
            }
        }
    }

    pub fn permission(&self) -> Permission {
        self.dispatcher.permission()
    }

    /// The banner asking for notification permission is shown only while the
    /// user has neither answered nor dismissed it.
    pub fn notification_banner_visible(&self) -> bool {
        self.permission() == Permission::Default && !self.store.notification_banner_closed()
    }

    pub fn grant_notifications(&mut self) -> Result<()> {
        Permission::Granted.store(self.store.kv().as_ref())?;
        self.dispatcher.show(
            "Notifications enabled",
            "You will now receive reminders for your tasks!",
            NotificationData::default(),
        );
        self.reschedule();
        Ok(())
    }

    /// Records the refusal, hides the banner for good and returns the one-time advisory.
    pub fn deny_notifications(&mut self) -> Result<&'static str> {
        Permission::Denied.store(self.store.kv().as_ref())?;
        self.store.close_notification_banner()?;
        Ok(PERMISSION_ADVISORY)
    }

    pub fn dismiss_notification_banner(&self) -> Result<()> {
        self.store.close_notification_banner()
    }

    pub fn install_banner_visible(&self) -> bool {
        !self.store.install_banner_closed()
    }

    pub fn dismiss_install_banner(&self) -> Result<()> {
        self.store.close_install_banner()
    }

    fn reschedule(&mut self) -> usize {
        if !self.local_reminders {
            self.scheduler.cancel_all();
            return 0;
        }
        self.scheduler.refresh(self.store.tasks(), Utc::now())
    }
}
