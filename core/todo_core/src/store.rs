use crate::{
    error::Result,
    kv::{KvStore, INSTALL_BANNER_CLOSED_KEY, NOTIFICATION_BANNER_CLOSED_KEY, TODOS_KEY},
    task::{Task, TaskId},
};
use chrono::{DateTime, Utc};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, warn};

/// Reads the persisted task array.
///
/// A missing key, an unreadable store, or a value that fails to parse all
/// yield an empty list; corrupted state is never surfaced to the user.
pub fn load_tasks(kv: &dyn KvStore) -> Vec<Task> {
    let raw = match kv.get(TODOS_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(err) => {
            warn!("reading tasks failed, starting empty: {err}");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<Task>>(&raw) {
        Ok(tasks) => tasks,
        Err(err) => {
            warn!("stored tasks are not parseable, starting empty: {err}");
            Vec::new()
        }
    }
}

pub fn save_tasks(kv: &dyn KvStore, tasks: &[Task]) -> Result<()> {
    let raw = serde_json::to_string(tasks)?;
    kv.set(TODOS_KEY, &raw)
}

/// Owns the authoritative task list and mirrors every change to storage.
pub struct TaskStore {
    kv: Arc<dyn KvStore>,
    tasks: Vec<Task>,
}

impl TaskStore {
    pub fn load(kv: Arc<dyn KvStore>) -> Self {
        let tasks = load_tasks(kv.as_ref());
        debug!("loaded {} tasks", tasks.len());
        Self { kv, tasks }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Overwrites the persisted collection with the in-memory one.
    pub fn save(&self) -> Result<()> {
        save_tasks(self.kv.as_ref(), &self.tasks)
    }

    pub fn add(&mut self, text: &str, due_date: Option<DateTime<Utc>>) -> Result<Option<Task>> {
        self.add_at(text, due_date, Utc::now())
    }

    /// Appends a new task. Whitespace-only text is ignored and returns `None`.
    pub fn add_at(
        &mut self,
        text: &str,
        due_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let task = Task::new(self.next_id(now), text, now).with_due_date(due_date);
        self.tasks.push(task.clone());
        self.save()?;
        Ok(Some(task))
    }

    /// Flips completion. Returns false if no task has that id.
    pub fn toggle(&mut self, id: TaskId) -> Result<bool> {
        let found = match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(t) => {
                t.completed = !t.completed;
                true
            }
            None => false,
        };
        self.save()?;
        Ok(found)
    }

    /// Marks a task completed; already-completed tasks stay completed.
    pub fn complete(&mut self, id: TaskId) -> Result<bool> {
        let found = match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(t) => {
                t.completed = true;
                true
            }
            None => false,
        };
        self.save()?;
        Ok(found)
    }

    pub fn delete(&mut self, id: TaskId) -> Result<bool> {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.id != id);
        self.save()?;
        Ok(self.tasks.len() != before)
    }

    /// Drops every completed task, keeping the rest in order. Returns how many were removed.
    pub fn clear_completed(&mut self) -> Result<usize> {
        let before = self.tasks.len();
        self.tasks.retain(|t| !t.completed);
        self.save()?;
        Ok(before - self.tasks.len())
    }

    pub fn install_banner_closed(&self) -> bool {
        self.kv.flag(INSTALL_BANNER_CLOSED_KEY)
    }

    pub fn close_install_banner(&self) -> Result<()> {
        self.kv.set(INSTALL_BANNER_CLOSED_KEY, "true")
    }

    pub fn notification_banner_closed(&self) -> bool {
        self.kv.flag(NOTIFICATION_BANNER_CLOSED_KEY)
    }

    pub fn close_notification_banner(&self) -> Result<()> {
        self.kv.set(NOTIFICATION_BANNER_CLOSED_KEY, "true")
    }

    // Creation time in ms, bumped past the largest existing id so two adds in
    // the same millisecond stay distinct.
    fn next_id(&self, now: DateTime<Utc>) -> TaskId {
        let candidate = now.timestamp_millis();
        let max_existing = self.tasks.iter().map(|t| t.id.0).max();
        match max_existing {
            None => TaskId(candidate),
            Some(max) => match max.checked_add(1) {
                Some(next) => TaskId(candidate.max(next)),
                // An id already sits at i64::MAX: take the first free one.
                None => {
                    let used: HashSet<i64> = self.tasks.iter().map(|t| t.id.0).collect();
                    let mut id = candidate;
                    while used.contains(&id) {
                        id = id.wrapping_add(1);
                    }
                    TaskId(id)
                }
            },
        }
    }
}
