//! Output module for run reports and store inspection
//!
//! This module handles:
//! - Writing the final JSON report of a run
//! - Printing a human summary when a run ends
//! - Reading back sink and checkpoint statistics for `--stats` and `--sample`

mod report;
pub mod stats;

pub use report::{print_summary, write_report, FinalReport, ReportSettings};
pub use stats::{load_statistics, print_sample, print_statistics, StoreStatistics};
