//! Pure rendering of the task list; no I/O.

use crate::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use std::{fmt, str::FromStr};

pub const EMPTY_MESSAGE: &str = "No tasks to show";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Filter {
    #[default]
    All,
    Active,
    Completed,
}

impl Filter {
    pub fn as_str(self) -> &'static str {
        match self {
            Filter::All => "all",
            Filter::Active => "active",
            Filter::Completed => "completed",
        }
    }

    pub fn matches(self, task: &Task) -> bool {
        match self {
            Filter::All => true,
            Filter::Active => !task.completed,
            Filter::Completed => task.completed,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Filter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Filter::All),
            "active" => Ok(Filter::Active),
            "completed" => Ok(Filter::Completed),
            other => Err(format!(
                "unknown filter '{other}' (expected all, active or completed)"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListItem {
    pub id: TaskId,
    pub text: String,
    pub completed: bool,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListView {
    pub filter: Filter,
    pub items: Vec<ListItem>,
    /// Incomplete tasks across the whole list, regardless of filter.
    pub items_left: usize,
}

impl ListView {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn empty_message(&self) -> Option<&'static str> {
        self.is_empty().then_some(EMPTY_MESSAGE)
    }

    pub fn items_left_label(&self) -> String {
        items_left_label(self.items_left)
    }
}

pub fn items_left_label(n: usize) -> String {
    if n == 1 {
        "1 task left".to_string()
    } else {
        format!("{n} tasks left")
    }
}

/// Selects the tasks matching `filter`, keeping storage order.
pub fn render(tasks: &[Task], filter: Filter) -> ListView {
    ListView {
        filter,
        items: tasks
            .iter()
            .filter(|t| filter.matches(t))
            .map(|t| ListItem {
                id: t.id,
                text: t.text.clone(),
                completed: t.completed,
                due_date: t.due_date,
            })
            .collect(),
        items_left: tasks.iter().filter(|t| !t.completed).count(),
    }
}
