//! Data aggregation module
//!
//! Records from every session flow through one `DataAggregator`, which:
//! - drops records already seen under the same (title, target key)
//! - buffers accepted records in memory
//! - flushes batches to the append-only sink on size or time triggers
//! - keeps running totals for the final report

mod record;
mod writer;

pub use record::{render_row, Column, Record};
pub use writer::DataAggregator;

use serde::Serialize;
use std::collections::BTreeMap;

/// Result of handing one batch of records to the aggregator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub accepted: usize,
    pub duplicates: usize,
}

/// Snapshot of aggregator counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatorStats {
    /// Unique records accepted
    pub total_received: u64,
    pub total_written: u64,
    /// Records accepted but not yet written
    pub buffer_size: usize,
    pub duplicates_skipped: u64,
    pub write_operations: u64,
    /// Failed flush attempts
    pub errors: u64,
    pub by_target_key: BTreeMap<String, u64>,
    pub by_session: BTreeMap<String, u64>,
    pub sink_location: String,
}
