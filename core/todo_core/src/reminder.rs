//! Due-date arithmetic shared by the foreground scheduler and the background runner.

use chrono::{DateTime, Duration, Utc};

/// How long before the due time the early reminder fires.
pub const REMINDER_LEAD_MINUTES: i64 = 15;
/// Window the periodic wake uses to decide a task is coming up.
pub const DUE_SOON_WINDOW_MINUTES: i64 = 30;
pub const WAKE_INTERVAL_MINUTES: u64 = 60;

pub const REMINDER_TITLE: &str = "Task reminder";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReminderTimes {
    /// Early reminder, present only while still in the future.
    pub reminder_at: Option<DateTime<Utc>>,
    pub due_at: DateTime<Utc>,
}

/// Instants at which a task due at `due` should alert.
///
/// Returns `None` when `due` is not in the future: past-due tasks are never
/// reminded.
pub fn compute_reminder_times(
    due: DateTime<Utc>,
    now: DateTime<Utc>,
    lead: Duration,
) -> Option<ReminderTimes> {
    if due <= now {
        return None;
    }
    let early = due - lead;
    Some(ReminderTimes {
        reminder_at: (early > now).then_some(early),
        due_at: due,
    })
}

/// True when `due` lies strictly inside `(now, now + window)`.
pub fn due_within_window(due: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    let left = due - now;
    left > Duration::zero() && left < window
}

pub fn due_body(text: &str) -> String {
    format!("Time to: {text}")
}

pub fn upcoming_body(text: &str, lead_minutes: i64) -> String {
    format!("In {lead_minutes} minutes: {text}")
}

pub fn due_soon_body(text: &str) -> String {
    format!("Coming up soon: {text}")
}
