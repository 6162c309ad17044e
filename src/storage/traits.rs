//! Storage traits and error types
//!
//! Two narrow interfaces sit behind the orchestration core: a checkpoint
//! store written only by the session registry, and an append-only record
//! sink written only by the data aggregator.

use crate::sessions::Session;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sink schema mismatch: expected columns [{expected}], found [{found}]")]
    SchemaMismatch { expected: String, found: String },

    #[error("Row has {got} values, sink expects {expected}")]
    RowWidth { expected: usize, got: usize },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable per-session checkpoints, keyed by session id
pub trait CheckpointStore: Send + Sync {
    /// Writes the session's current state, replacing any previous checkpoint
    fn put(&self, session: &Session) -> StorageResult<()>;

    /// Loads every stored checkpoint
    ///
    /// Checkpoints that cannot be decoded are skipped, not reported as errors.
    fn get_all(&self) -> StorageResult<Vec<Session>>;

    /// Removes a checkpoint; deleting a missing id is not an error
    fn delete(&self, session_id: &str) -> StorageResult<()>;

    /// Removes every checkpoint, returning how many were dropped
    fn clear(&self) -> StorageResult<usize>;
}

/// Append-only destination for rendered record rows
///
/// Every row holds one value per sink column, in schema order.
pub trait RecordSink: Send + Sync {
    /// Prepares the sink
    ///
    /// Returns true when the sink was created by this call, false when an
    /// existing sink with a matching schema was found.
    fn initialize(&self) -> StorageResult<bool>;

    /// Appends all rows atomically: either every row lands or none do
    fn append(&self, rows: &[Vec<String>]) -> StorageResult<usize>;

    /// Number of rows written so far
    fn count(&self) -> StorageResult<u64>;

    /// The most recently appended rows, newest last
    fn recent(&self, limit: usize) -> StorageResult<Vec<Vec<String>>>;

    /// Human-readable location, used in logs and reports
    fn location(&self) -> String;
}
