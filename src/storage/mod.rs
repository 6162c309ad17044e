//! Storage module for durable state
//!
//! This module holds everything that touches disk:
//! - Session checkpoints, written by the session registry
//! - The append-only record sink, written by the data aggregator
//! - SQLite schema management for both

mod schema;
mod sqlite;
mod traits;

pub use sqlite::{open_database, SqliteCheckpointStore, SqliteRecordSink};
pub use traits::{CheckpointStore, RecordSink, StorageError, StorageResult};
