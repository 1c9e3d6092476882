//! In-process reminder timers.
//!
//! The scheduler is a disposable view over the task list: it keeps only timer
//! handles keyed by task id and can always be rebuilt from storage. Each armed
//! task gets a due-time timer and, when it is still ahead, an early reminder.

use crate::{
    kv::KvStore,
    notify::{Dispatcher, NotificationData},
    reminder::{
        compute_reminder_times, due_body, upcoming_body, REMINDER_LEAD_MINUTES, REMINDER_TITLE,
    },
    store::load_tasks,
    task::{Task, TaskId},
};
use chrono::{DateTime, Duration, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Due,
    /// Fires `lead` before the due time.
    Reminder,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArmedTimer {
    pub task_id: TaskId,
    pub kind: TimerKind,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Armed(usize),
    /// No due date, already completed, or due date not in the future.
    Skipped,
}

struct Timer {
    kind: TimerKind,
    at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

impl Timer {
    fn is_pending(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct ReminderScheduler {
    kv: Arc<dyn KvStore>,
    dispatcher: Arc<Dispatcher>,
    lead: Duration,
    armed: HashMap<TaskId, Vec<Timer>>,
}

impl ReminderScheduler {
    pub fn new(kv: Arc<dyn KvStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            kv,
            dispatcher,
            lead: Duration::minutes(REMINDER_LEAD_MINUTES),
            armed: HashMap::new(),
        }
    }

    pub fn with_lead(mut self, lead: Duration) -> Self {
        self.lead = lead;
        self
    }

    /// Cancels every armed timer, then arms again from `tasks`. Returns the
    /// number of timers armed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn refresh(&mut self, tasks: &[Task], now: DateTime<Utc>) -> usize {
        self.cancel_all();
        let armed: usize = tasks
            .iter()
            .filter(|t| t.is_active())
            .map(|t| self.arm(t, now))
            .sum();
        debug!("reminders refreshed: {armed} timers armed");
        armed
    }

    /// Re-arms a single task, replacing whatever was armed for its id.
    pub fn schedule_task(&mut self, task: &Task, now: DateTime<Utc>) -> ScheduleOutcome {
        self.cancel(task.id);
        if !task.is_active() {
            return ScheduleOutcome::Skipped;
        }
        match self.arm(task, now) {
            0 => ScheduleOutcome::Skipped,
            n => ScheduleOutcome::Armed(n),
        }
    }

    /// Returns how many of the task's timers were still pending.
    pub fn cancel(&mut self, id: TaskId) -> usize {
        self.armed
            .remove(&id)
            .map(|timers| timers.iter().filter(|t| t.is_pending()).count())
            .unwrap_or(0)
    }

    pub fn cancel_all(&mut self) {
        self.armed.clear();
    }

    /// Timers that have neither fired nor been canceled, earliest first.
    pub fn armed(&self) -> Vec<ArmedTimer> {
        let mut out: Vec<ArmedTimer> = self
            .armed
            .iter()
            .flat_map(|(id, timers)| {
                timers.iter().filter(|t| t.is_pending()).map(|t| ArmedTimer {
                    task_id: *id,
                    kind: t.kind,
                    at: t.at,
                })
            })
            .collect();
        out.sort_by_key(|t| (t.at, t.task_id));
        out
    }

    fn arm(&mut self, task: &Task, now: DateTime<Utc>) -> usize {
        // Drop entries whose timers have all fired.
        self.armed.retain(|_, timers| timers.iter().any(Timer::is_pending));
        let Some(due) = task.due_date else {
            return 0;
        };
        let Some(times) = compute_reminder_times(due, now, self.lead) else {
            debug!(task_id = %task.id, "due date already passed; no reminder");
            return 0;
        };

        let mut timers = Vec::with_capacity(2);
        timers.push(self.spawn_timer(task.id, TimerKind::Due, times.due_at, now));
        if let Some(at) = times.reminder_at {
            timers.push(self.spawn_timer(task.id, TimerKind::Reminder, at, now));
        }
        let n = timers.len();
        self.armed.insert(task.id, timers);
        n
    }

    fn spawn_timer(&self, id: TaskId, kind: TimerKind, at: DateTime<Utc>, now: DateTime<Utc>) -> Timer {
        // Deadline is fixed on the tokio clock now, not when the task is first polled.
        let delay = (at - now).to_std().unwrap_or_default();
        let deadline = Instant::now() + delay;
        let kv = self.kv.clone();
        let dispatcher = self.dispatcher.clone();
        let lead_minutes = self.lead.num_minutes();
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            fire(kv.as_ref(), &dispatcher, id, kind, lead_minutes);
        });
        Timer { kind, at, handle }
    }
}

/// Looks the task up in storage again before alerting: it may have been
/// completed or deleted since the timer was armed.
fn fire(
    kv: &dyn KvStore,
    dispatcher: &Dispatcher,
    id: TaskId,
    kind: TimerKind,
    lead_minutes: i64,
) -> bool {
    let tasks = load_tasks(kv);
    let Some(task) = tasks.iter().find(|t| t.id == id) else {
        debug!(task_id = %id, "reminder suppressed: task no longer exists");
        return false;
    };
    if task.completed {
        debug!(task_id = %id, "reminder suppressed: task completed");
        return false;
    }
    let body = match kind {
        TimerKind::Due => due_body(&task.text),
        TimerKind::Reminder => upcoming_body(&task.text, lead_minutes),
    };
    dispatcher.show(REMINDER_TITLE, &body, NotificationData::for_task(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kv::MemoryKv,
        notify::{MemoryBackend, Permission},
        store::TaskStore,
    };
    use std::time::Duration as StdDuration;

    struct Harness {
        store: TaskStore,
        scheduler: ReminderScheduler,
        backend: MemoryBackend,
    }

    fn harness() -> Harness {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        Permission::Granted.store(kv.as_ref()).unwrap();
        let backend = MemoryBackend::new();
        let dispatcher = Arc::new(Dispatcher::new(kv.clone(), Arc::new(backend.clone())));
        Harness {
            store: TaskStore::load(kv.clone()),
            scheduler: ReminderScheduler::new(kv, dispatcher),
            backend,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance_minutes(m: u64) {
        tokio::time::advance(StdDuration::from_secs(m * 60)).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn future_due_date_arms_two_timers() {
        let mut h = harness();
        let now = Utc::now();
        h.store.add_at("Buy milk", Some(now + Duration::hours(1)), now).unwrap();

        assert_eq!(h.scheduler.refresh(h.store.tasks(), now), 2);
        let armed = h.scheduler.armed();
        assert_eq!(armed.len(), 2);
        assert_eq!(armed[0].kind, TimerKind::Reminder);
        assert_eq!(armed[0].at, now + Duration::minutes(45));
        assert_eq!(armed[1].kind, TimerKind::Due);
        assert_eq!(armed[1].at, now + Duration::hours(1));
    }

    #[tokio::test(start_paused = true)]
    async fn due_inside_lead_arms_only_due_timer() {
        let mut h = harness();
        let now = Utc::now();
        h.store.add_at("Soon", Some(now + Duration::minutes(10)), now).unwrap();

        assert_eq!(h.scheduler.refresh(h.store.tasks(), now), 1);
        assert_eq!(h.scheduler.armed()[0].kind, TimerKind::Due);
    }

    #[tokio::test(start_paused = true)]
    async fn past_due_and_undated_tasks_arm_nothing() {
        let mut h = harness();
        let now = Utc::now();
        h.store.add_at("Late", Some(now - Duration::minutes(1)), now).unwrap();
        h.store.add_at("Whenever", None, now).unwrap();

        assert_eq!(h.scheduler.refresh(h.store.tasks(), now), 0);
        assert!(h.scheduler.armed().is_empty());

        advance_minutes(24 * 60).await;
        assert!(h.backend.shown().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn completed_before_due_suppresses_fire() {
        let mut h = harness();
        let now = Utc::now();
        let t = h
            .store
            .add_at("Call back", Some(now + Duration::hours(1)), now)
            .unwrap()
            .unwrap();
        h.scheduler.refresh(h.store.tasks(), now);

        // Completion is written to storage without telling the scheduler.
        h.store.toggle(t.id).unwrap();
        advance_minutes(61).await;

        assert!(h.backend.shown().is_empty());
        assert!(h.scheduler.armed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_task_does_not_fire() {
        let mut h = harness();
        let now = Utc::now();
        let t = h
            .store
            .add_at("Gone", Some(now + Duration::minutes(5)), now)
            .unwrap()
            .unwrap();
        h.scheduler.refresh(h.store.tasks(), now);
        h.store.delete(t.id).unwrap();

        advance_minutes(6).await;
        assert!(h.backend.shown().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_refreshes_never_duplicate_timers() {
        let mut h = harness();
        let now = Utc::now();
        h.store.add_at("a", Some(now + Duration::hours(2)), now).unwrap();
        h.store.add_at("b", Some(now + Duration::hours(3)), now).unwrap();

        for _ in 0..5 {
            h.scheduler.refresh(h.store.tasks(), now);
        }
        let armed = h.scheduler.armed();
        assert_eq!(armed.len(), 4);
        for t in h.store.tasks() {
            let due = armed
                .iter()
                .filter(|a| a.task_id == t.id && a.kind == TimerKind::Due)
                .count();
            let early = armed
                .iter()
                .filter(|a| a.task_id == t.id && a.kind == TimerKind::Reminder)
                .count();
            assert_eq!((due, early), (1, 1));
        }

        // Aborted timers from earlier refreshes must not fire either.
        advance_minutes(3 * 60 + 1).await;
        assert_eq!(h.backend.shown().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_buy_milk_fires_reminder_then_due() {
        let mut h = harness();
        let now = Utc::now();
        h.store.add_at("Buy milk", Some(now + Duration::hours(1)), now).unwrap();
        h.scheduler.refresh(h.store.tasks(), now);

        advance_minutes(45).await;
        let shown = h.backend.shown();
        assert_eq!(shown.len(), 1);
        assert!(shown[0].body.contains("15"));
        assert_eq!(shown[0].title, REMINDER_TITLE);

        advance_minutes(15).await;
        let shown = h.backend.shown();
        assert_eq!(shown.len(), 2);
        assert!(shown[1].body.contains("Buy milk"));
        assert!(h.scheduler.armed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_task_replaces_previous_timers_for_that_id() {
        let mut h = harness();
        let now = Utc::now();
        let mut t = h
            .store
            .add_at("Move", Some(now + Duration::hours(1)), now)
            .unwrap()
            .unwrap();
        assert_eq!(h.scheduler.schedule_task(&t, now), ScheduleOutcome::Armed(2));

        t.due_date = Some(now + Duration::hours(5));
        assert_eq!(h.scheduler.schedule_task(&t, now), ScheduleOutcome::Armed(2));
        let armed = h.scheduler.armed();
        assert_eq!(armed.len(), 2);
        assert!(armed.iter().all(|a| a.at > now + Duration::hours(4)));

        t.completed = true;
        assert_eq!(h.scheduler.schedule_task(&t, now), ScheduleOutcome::Skipped);
        assert!(h.scheduler.armed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fired_entries_are_pruned_on_next_arm() {
        let mut h = harness();
        let now = Utc::now();
        let first = h
            .store
            .add_at("first", Some(now + Duration::minutes(5)), now)
            .unwrap()
            .unwrap();
        h.scheduler.schedule_task(&first, now);
        advance_minutes(6).await;
        assert_eq!(h.backend.shown().len(), 1);

        let later = Utc::now();
        let second = h
            .store
            .add_at("second", Some(later + Duration::hours(2)), later)
            .unwrap()
            .unwrap();
        h.scheduler.schedule_task(&second, later);

        assert_eq!(h.scheduler.armed.len(), 1);
        assert!(h.scheduler.armed.contains_key(&second.id));
    }

    #[tokio::test(start_paused = true)]
    async fn fire_uses_current_text_from_storage() {
        let mut h = harness();
        let now = Utc::now();
        let t = h
            .store
            .add_at("old", Some(now + Duration::minutes(5)), now)
            .unwrap()
            .unwrap();
        h.scheduler.refresh(h.store.tasks(), now);

        let mut tasks = h.store.tasks().to_vec();
        tasks[0].text = "renamed".to_string();
        crate::store::save_tasks(h.store.kv().as_ref(), &tasks).unwrap();

        advance_minutes(5).await;
        let shown = h.backend.shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].body, "Time to: renamed");
        assert_eq!(shown[0].data.id, Some(t.id));
    }
}
