//! Statistics read back from the durable stores
//!
//! This module provides functionality for inspecting what previous runs
//! left behind: rows in the record sink and checkpoints still on disk.

use crate::sessions::Session;
use crate::state::SessionStatus;
use crate::storage::{CheckpointStore, RecordSink};
use std::collections::BTreeMap;

/// Snapshot of both durable stores
#[derive(Debug, Clone)]
pub struct StoreStatistics {
    pub sink_location: String,

    /// Rows in the record sink
    pub records_written: u64,

    /// Checkpoints by session status
    pub checkpoints_by_status: BTreeMap<SessionStatus, usize>,

    /// Every persisted checkpoint, oldest first
    pub checkpoints: Vec<Session>,
}

impl StoreStatistics {
    /// Checkpoints a restart would bring back as Recovering
    pub fn resumable(&self) -> usize {
        self.checkpoints
            .iter()
            .filter(|s| s.status.is_interrupted() || s.status == SessionStatus::Recovering)
            .count()
    }
}

/// Loads statistics from the checkpoint store and record sink
///
/// # Arguments
///
/// * `store` - Checkpoint store to scan
/// * `sink` - Record sink to count
///
/// # Returns
///
/// * `Ok(StoreStatistics)` - Successfully loaded statistics
/// * `Err(GleanerError)` - Failed to query a store
pub fn load_statistics(
    store: &dyn CheckpointStore,
    sink: &dyn RecordSink,
) -> crate::Result<StoreStatistics> {
    let records_written = sink.count()?;

    let mut checkpoints = store.get_all()?;
    checkpoints.sort_by_key(|s| s.created_at);

    let mut checkpoints_by_status = BTreeMap::new();
    for session in &checkpoints {
        *checkpoints_by_status.entry(session.status).or_insert(0) += 1;
    }

    Ok(StoreStatistics {
        sink_location: sink.location(),
        records_written,
        checkpoints_by_status,
        checkpoints,
    })
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &StoreStatistics) {
    println!("=== Harvest Statistics ===\n");

    println!("Record sink:");
    println!("  Location: {}", stats.sink_location);
    println!("  Records written: {}", stats.records_written);
    println!();

    println!("Checkpoints ({}):", stats.checkpoints.len());
    for (status, count) in &stats.checkpoints_by_status {
        println!("  {}: {}", status, count);
    }
    println!();

    if !stats.checkpoints.is_empty() {
        println!("Sessions:");
        for session in &stats.checkpoints {
            let last_error = session
                .errors
                .last()
                .map(|e| format!(" ({}: {})", e.kind, e.message))
                .unwrap_or_default();
            println!(
                "  - {} [{}] {} records, {} pages{}",
                session.id, session.status, session.records_count, session.pages_count, last_error
            );
        }
        println!();
    }

    println!("Resumable on next run: {}", stats.resumable());
}

/// Prints sampled rows, one block per record
pub fn print_sample(rows: &[Vec<(&'static str, String)>]) {
    if rows.is_empty() {
        println!("No records written yet.");
        return;
    }

    for (i, row) in rows.iter().enumerate() {
        println!("--- Record {} ---", i + 1);
        for (name, value) in row {
            if !value.is_empty() {
                println!("  {:<20} {}", name, value);
            }
        }
    }
}
