//! SQLite storage implementations
//!
//! Both stores wrap a single connection in a mutex so they can be shared
//! between tokio tasks.

use crate::aggregator::Column;
use crate::sessions::Session;
use crate::storage::schema::{
    column_marker, initialize_checkpoint_schema, initialize_sink_schema, insert_record_sql,
    COLUMNS_META_KEY,
};
use crate::storage::traits::{CheckpointStore, RecordSink, StorageError, StorageResult};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Opens a database file with the pragmas every store uses
///
/// Parent directories are created when missing.
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(Connection)` - Successfully opened/created database
/// * `Err(StorageError)` - Failed to create the directory or open the database
pub fn open_database(path: &Path) -> StorageResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;

    // Configure SQLite for better performance
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA temp_store = MEMORY;
    ",
    )?;

    Ok(conn)
}

/// Session checkpoints stored as JSON documents
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Opens (or creates) the checkpoint database at `path`
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = open_database(path)?;
        initialize_checkpoint_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory checkpoint store
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_checkpoint_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn put(&self, session: &Session) -> StorageResult<()> {
        let payload = serde_json::to_string(session)?;
        let now = Utc::now().to_rfc3339();

        self.lock().execute(
            "INSERT OR REPLACE INTO checkpoints (session_id, target_key, status, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.id,
                session.target_key,
                session.status.to_db_string(),
                payload,
                now
            ],
        )?;
        Ok(())
    }

    fn get_all(&self) -> StorageResult<Vec<Session>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT session_id, payload FROM checkpoints ORDER BY updated_at")?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (session_id, payload) = row?;
            match serde_json::from_str::<Session>(&payload) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(session = %session_id, "Skipping unreadable checkpoint: {}", e);
                }
            }
        }

        Ok(sessions)
    }

    fn delete(&self, session_id: &str) -> StorageResult<()> {
        self.lock().execute(
            "DELETE FROM checkpoints WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    fn clear(&self) -> StorageResult<usize> {
        let removed = self.lock().execute("DELETE FROM checkpoints", [])?;
        Ok(removed)
    }
}

/// Append-only record table
pub struct SqliteRecordSink {
    conn: Mutex<Connection>,
    location: String,
}

impl SqliteRecordSink {
    /// Opens the sink database at `path`
    ///
    /// The schema is not touched until `initialize` is called.
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = open_database(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            location: path.display().to_string(),
        })
    }

    /// Opens the sink database at `path` only if the file already exists
    pub fn open_existing(path: &Path) -> StorageResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        Self::new(path).map(Some)
    }

    /// Creates an in-memory sink
    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            location: ":memory:".to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// True once `initialize` has created the records table
fn has_records_table(conn: &Connection) -> StorageResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'records'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

impl RecordSink for SqliteRecordSink {
    fn initialize(&self) -> StorageResult<bool> {
        let conn = self.lock();
        initialize_sink_schema(&conn)?;

        let expected = column_marker();
        let found: Option<String> = conn
            .query_row(
                "SELECT value FROM sink_meta WHERE key = ?1",
                params![COLUMNS_META_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match found {
            None => {
                conn.execute(
                    "INSERT INTO sink_meta (key, value) VALUES (?1, ?2)",
                    params![COLUMNS_META_KEY, expected],
                )?;
                Ok(true)
            }
            Some(found) if found == expected => Ok(false),
            Some(found) => Err(StorageError::SchemaMismatch { expected, found }),
        }
    }

    fn append(&self, rows: &[Vec<String>]) -> StorageResult<usize> {
        let width = Column::ALL.len();
        if let Some(bad) = rows.iter().find(|row| row.len() != width) {
            return Err(StorageError::RowWidth {
                expected: width,
                got: bad.len(),
            });
        }

        let written_at = Utc::now().to_rfc3339();
        let sql = insert_record_sql();

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for row in rows {
                let values = row
                    .iter()
                    .map(String::as_str)
                    .chain(std::iter::once(written_at.as_str()));
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;

        Ok(rows.len())
    }

    fn count(&self) -> StorageResult<u64> {
        let conn = self.lock();
        if !has_records_table(&conn)? {
            return Ok(0);
        }
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn recent(&self, limit: usize) -> StorageResult<Vec<Vec<String>>> {
        let names: Vec<&str> = Column::ALL.iter().map(|c| c.name()).collect();
        let sql = format!(
            "SELECT {} FROM records ORDER BY id DESC LIMIT ?1",
            names.join(", ")
        );

        let conn = self.lock();
        if !has_records_table(&conn)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            (0..names.len())
                .map(|i| row.get::<_, String>(i))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let mut result = rows.collect::<Result<Vec<_>, _>>()?;
        result.reverse();
        Ok(result)
    }

    fn location(&self) -> String {
        self.location.clone()
    }
}
