use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

/// Serialized task array.
pub const TODOS_KEY: &str = "todos";
pub const INSTALL_BANNER_CLOSED_KEY: &str = "installBannerClosed";
pub const NOTIFICATION_BANNER_CLOSED_KEY: &str = "notificationBannerClosed";
pub const NOTIFICATION_PERMISSION_KEY: &str = "notificationPermission";
pub const PUSH_SUBSCRIPTION_KEY: &str = "pushSubscription";

/// Opaque string key-value storage shared by the view and the background runner.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Ok(Some(v)) if v == "true")
    }
}

/// SQLite-backed store. Both processes open the same file; last write wins.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS kv_store (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#,
    )
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let value = conn
            .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.conn().execute(
            r#"
INSERT INTO kv_store (key, value, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET
  value=excluded.value,
  updated_at=excluded.updated_at
            "#,
            (key, value, updated_at.as_str()),
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(())
    }
}

/// In-process store, mostly for tests.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_kv_overwrites_and_removes() {
        let kv = SqliteKv::open_in_memory().unwrap();
        assert_eq!(kv.get(TODOS_KEY).unwrap(), None);

        kv.set(TODOS_KEY, "[]").unwrap();
        kv.set(TODOS_KEY, "[1]").unwrap();
        assert_eq!(kv.get(TODOS_KEY).unwrap().as_deref(), Some("[1]"));

        kv.remove(TODOS_KEY).unwrap();
        assert_eq!(kv.get(TODOS_KEY).unwrap(), None);
    }

    #[test]
    fn flag_is_true_only_for_literal_true() {
        let kv = MemoryKv::new();
        assert!(!kv.flag(INSTALL_BANNER_CLOSED_KEY));
        kv.set(INSTALL_BANNER_CLOSED_KEY, "yes").unwrap();
        assert!(!kv.flag(INSTALL_BANNER_CLOSED_KEY));
        kv.set(INSTALL_BANNER_CLOSED_KEY, "true").unwrap();
        assert!(kv.flag(INSTALL_BANNER_CLOSED_KEY));
    }

    #[test]
    fn sqlite_kv_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("todo_core_kv_{}", std::process::id()));
        let path = dir.join("nested").join("todo.db");
        let kv = SqliteKv::open(&path).unwrap();
        kv.set("k", "v").unwrap();
        drop(kv);

        let reopened = SqliteKv::open(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
