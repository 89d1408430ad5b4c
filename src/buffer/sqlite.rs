//! SQLite-backed durable spool

use super::store::{BufferStore, BufferedEntry, InsertOutcome};
use crate::error::{Result, RuntimeError};
use edge_shared::Message;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Schema version tracked in `PRAGMA user_version`
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS buffered_messages (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT    NOT NULL UNIQUE,
    priority      INTEGER NOT NULL,   -- 0 = LOW .. 3 = URGENT
    buffered_at   INTEGER NOT NULL,   -- epoch ms
    expires_at    INTEGER NOT NULL,   -- epoch ms
    attempt_count INTEGER NOT NULL DEFAULT 0,
    body          TEXT    NOT NULL    -- Message as JSON
);

CREATE INDEX IF NOT EXISTS idx_buffered_flush_order
    ON buffered_messages (priority DESC, buffered_at ASC, seq ASC);

CREATE INDEX IF NOT EXISTS idx_buffered_expiry
    ON buffered_messages (expires_at);
"#;

/// Offline spool persisted in a local SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the spool at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        let store = Self::init(conn)?;
        info!("[BUFFER] Opened spool at {}", path.display());
        Ok(store)
    }

    /// Spool that lives only as long as this value
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(RuntimeError::Config(format!(
                "spool schema v{} is newer than supported v{}",
                version, SCHEMA_VERSION
            )));
        }
        conn.execute_batch(SCHEMA_SQL)?;
        if version < SCHEMA_VERSION {
            // PRAGMA does not take parameters; the value is a constant
            conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
            debug!("[BUFFER] Spool schema initialized at v{}", SCHEMA_VERSION);
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BufferStore for SqliteStore {
    fn insert_bounded(&self, entry: &BufferedEntry, max_size: usize) -> Result<InsertOutcome> {
        let body = serde_json::to_string(&entry.message)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT seq FROM buffered_messages WHERE id = ?1",
                params![entry.message.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(InsertOutcome::Duplicate);
        }

        let count: i64 = tx.query_row("SELECT COUNT(*) FROM buffered_messages", [], |row| {
            row.get(0)
        })?;
        if count as usize >= max_size {
            return Ok(InsertOutcome::Full);
        }

        tx.execute(
            "INSERT INTO buffered_messages (id, priority, buffered_at, expires_at, attempt_count, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.message.id,
                entry.message.priority.rank() as i64,
                entry.buffered_at as i64,
                entry.expires_at as i64,
                entry.attempt_count as i64,
                body,
            ],
        )?;
        tx.commit()?;
        Ok(InsertOutcome::Inserted)
    }

    fn pending(&self) -> Result<Vec<BufferedEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT body, buffered_at, expires_at, attempt_count
             FROM buffered_messages
             ORDER BY priority DESC, buffered_at ASC, seq ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(body, buffered_at, expires_at, attempt_count)| {
                let message: Message = serde_json::from_str(&body)?;
                Ok(BufferedEntry {
                    message,
                    buffered_at: buffered_at as u64,
                    expires_at: expires_at as u64,
                    attempt_count: attempt_count as u32,
                })
            })
            .collect()
    }

    fn record_attempt(&self, id: &str, attempt_count: u32) -> Result<()> {
        self.lock().execute(
            "UPDATE buffered_messages SET attempt_count = ?1 WHERE id = ?2",
            params![attempt_count as i64, id],
        )?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let removed = self
            .lock()
            .execute("DELETE FROM buffered_messages WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn remove_expired(&self, now_ms: u64) -> Result<usize> {
        let removed = self.lock().execute(
            "DELETE FROM buffered_messages WHERE expires_at < ?1",
            params![now_ms as i64],
        )?;
        Ok(removed)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM buffered_messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn kind(&self) -> &'static str {
        "sqlite"
    }
}
