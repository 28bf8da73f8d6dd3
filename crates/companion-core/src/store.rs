use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::db::init_db;
use crate::error::Result;

/// Durable string key-value store shared by every engine component.
///
/// Records are read-modify-written whole; there are no transactions across
/// keys. `compare_and_swap` is the one atomic primitive and is what the
/// advisory locks are built on.
pub trait KvStore: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Silent no-op when it does not exist.
    fn delete(&self, key: &str) -> Result<()>;

    /// Atomically replace the value at `key` if it currently equals `expected`.
    ///
    /// `expected = None` means "key must be absent"; `new = None` deletes.
    /// Returns `true` when the swap happened.
    fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: Option<&str>)
        -> Result<bool>;
}

impl<'a> dyn KvStore + 'a {
    /// Load and decode a JSON record. `Ok(None)` when the key is absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_string(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Encode and store a JSON record, overwriting whatever was there.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }
}

/// SQLite-backed store. One `kv_store` table, one row per logical record.
pub struct SqliteKvStore {
    db: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::new(conn)
    }
}

impl KvStore for SqliteKvStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        let value = db
            .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
            rusqlite::params![key, value, now],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let changed = match (expected, new) {
            (None, Some(new)) => db.execute(
                "INSERT OR IGNORE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![key, new, now],
            )?,
            (Some(old), Some(new)) => db.execute(
                "UPDATE kv_store SET value = ?1, updated_at = ?2 WHERE key = ?3 AND value = ?4",
                rusqlite::params![new, now, key, old],
            )?,
            (Some(old), None) => db.execute(
                "DELETE FROM kv_store WHERE key = ?1 AND value = ?2",
                rusqlite::params![key, old],
            )?,
            (None, None) => {
                let exists: Option<i64> = db
                    .query_row("SELECT 1 FROM kv_store WHERE key = ?1", [key], |row| {
                        row.get(0)
                    })
                    .optional()?;
                usize::from(exists.is_none())
            }
        };
        debug!(key, swapped = changed == 1, "compare_and_swap");
        Ok(changed == 1)
    }
}

/// In-process store for tests and ephemeral runs. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        let mut map = self.map.lock().unwrap();
        if map.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        match new {
            Some(v) => {
                map.insert(key.to_string(), v.to_string());
            }
            None => {
                map.remove(key);
            }
        }
        Ok(true)
    }
}
