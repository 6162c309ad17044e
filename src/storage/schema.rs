//! Database schema definitions
//!
//! The record table's data columns are generated from `Column::ALL` so the
//! sink schema and the row renderer cannot drift apart.

use crate::aggregator::Column;

/// SQL schema for the checkpoint database
pub const CHECKPOINT_SCHEMA_SQL: &str = r#"
-- One row per live or failed session
CREATE TABLE IF NOT EXISTS checkpoints (
    session_id TEXT PRIMARY KEY,
    target_key TEXT NOT NULL,
    status TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON checkpoints(status);
"#;

/// Key under which the sink records its column list
pub const COLUMNS_META_KEY: &str = "columns";

/// Builds the record sink schema
pub fn sink_schema_sql() -> String {
    let columns: Vec<String> = Column::ALL
        .iter()
        .map(|c| format!("    {} TEXT NOT NULL DEFAULT ''", c.name()))
        .collect();

    format!(
        r#"
-- Append-only record rows
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
{},
    written_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_target ON records(target_key);

-- Sink metadata, including the schema marker
CREATE TABLE IF NOT EXISTS sink_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#,
        columns.join(",\n")
    )
}

/// Comma-separated column list stored as the schema marker
pub fn column_marker() -> String {
    Column::ALL
        .iter()
        .map(|c| c.name())
        .collect::<Vec<_>>()
        .join(",")
}

/// INSERT statement for one record row plus its write timestamp
pub fn insert_record_sql() -> String {
    let names: Vec<&str> = Column::ALL.iter().map(|c| c.name()).collect();
    let placeholders: Vec<String> = (1..=names.len() + 1).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO records ({}, written_at) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    )
}

/// Initializes the checkpoint schema
pub fn initialize_checkpoint_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(CHECKPOINT_SCHEMA_SQL)?;
    Ok(())
}

/// Initializes the record sink schema
pub fn initialize_sink_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(&sink_schema_sql())?;
    Ok(())
}
