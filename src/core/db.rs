//! SQLite database handle shared by the ledger and intent stores.
//!
//! One connection guarded by a mutex; the lock is never held across an
//! `.await`, so store calls are short synchronous critical sections.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use uuid::Uuid;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a writer waits for another process holding the write lock
/// (e.g. `govflow sweep --watch` next to `govflow intent advance`).
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be decoded
    #[error("corrupt row in {table}: {details}")]
    Corrupt { table: &'static str, details: String },

    #[error("database lock poisoned")]
    Poisoned,

    /// Optimistic-concurrency check failed
    #[error("intent {intent_id} was modified concurrently (expected version {expected_version})")]
    VersionConflict { intent_id: Uuid, expected_version: i64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared SQLite handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create a database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory database for tests and dry runs
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Backing file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquire the connection
    pub(crate) fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(table: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            details: format!("bad timestamp '{}': {}", raw, e),
        })
}

pub(crate) fn parse_opt_ts(
    table: &'static str,
    raw: Option<String>,
) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(table, &r)).transpose()
}

pub(crate) fn parse_uuid(table: &'static str, raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt {
        table,
        details: format!("bad uuid '{}': {}", raw, e),
    })
}

pub(crate) fn parse_opt_uuid(table: &'static str, raw: Option<String>) -> StoreResult<Option<Uuid>> {
    raw.map(|r| parse_uuid(table, &r)).transpose()
}

/// Parse a text column through `FromStr`
pub(crate) fn parse_enum<T>(table: &'static str, raw: &str) -> StoreResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse::<T>()
        .map_err(|details| StoreError::Corrupt { table, details })
}

pub(crate) fn to_json_opt(value: &Option<serde_json::Value>) -> StoreResult<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

pub(crate) fn from_json_opt(raw: Option<String>) -> StoreResult<Option<serde_json::Value>> {
    raw.map(|r| serde_json::from_str(&r))
        .transpose()
        .map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_schema_applies_twice() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("govflow.db");

        let first = Database::open(&path).unwrap();
        drop(first);
        let second = Database::open(&path).unwrap();
        assert_eq!(second.path(), Some(path.as_path()));
    }

    #[test]
    fn test_second_handle_waits_for_writer() {
        use rusqlite::TransactionBehavior;
        use std::sync::mpsc;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("govflow.db");
        let first = Database::open(&path).unwrap();
        let second = Database::open(&path).unwrap();

        first
            .lock()
            .unwrap()
            .execute_batch("CREATE TABLE notes (body TEXT NOT NULL)")
            .unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let writer = std::thread::spawn(move || {
            let mut conn = first.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .unwrap();
            tx.execute("INSERT INTO notes (body) VALUES ('first')", []).unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(300));
            tx.commit().unwrap();
        });

        locked_rx.recv().unwrap();
        {
            let mut conn = second.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .unwrap();
            tx.execute("INSERT INTO notes (body) VALUES ('second')", []).unwrap();
            tx.commit().unwrap();
        }
        writer.join().unwrap();

        let count: i64 = second
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T09:00:00Z").unwrap().with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T10:00:00.5Z").unwrap().with_timezone(&Utc);

        let (a, b) = (format_ts(early), format_ts(late));
        assert!(a < b);
        assert_eq!(a.len(), b.len());
        assert_eq!(parse_ts("t", &b).unwrap(), late);
    }

    #[test]
    fn test_check_constraint_rejects_unknown_decision() {
        let db = Database::in_memory().unwrap();
        let conn = db.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO ledger_events (id, correlation_id, sequence_num, layer, host, service,
                policy_scope, actor_user_id, actor_role, action, resource_type, decision,
                ledger_level, required_ledger_level, occurred_at, recorded_at)
             VALUES ('a', 'c', 1, 'gateway', 'h', 's', 'p', 'u', 'r', 'x:y', 't', 'maybe',
                'decision', 'decision', 'now', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
