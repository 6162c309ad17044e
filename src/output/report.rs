//! Final run report
//!
//! Combines task, session, and aggregator counters into one JSON document
//! written when a run ends, plus a short human summary on stdout.

use crate::aggregator::AggregatorStats;
use crate::sessions::SessionStats;
use crate::tasks::TaskStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Effective settings recorded alongside the counters
#[derive(Debug, Clone, Serialize)]
pub struct ReportSettings {
    pub target_keys: Vec<String>,
    pub max_concurrent_sessions: usize,
    pub max_pages_per_target: u32,
    /// Hash of the configuration file that produced the run
    pub config_hash: String,
}

/// Everything known about a finished run
#[derive(Debug, Clone, Serialize)]
pub struct FinalReport {
    pub timestamp: DateTime<Utc>,
    pub runtime_seconds: f64,
    /// Completed tasks as a percentage of all tasks
    pub success_rate: f64,
    pub tasks: TaskStats,
    pub sessions: SessionStats,
    pub data: AggregatorStats,
    pub settings: ReportSettings,
}

impl FinalReport {
    pub fn new(
        runtime: Duration,
        tasks: TaskStats,
        sessions: SessionStats,
        data: AggregatorStats,
        settings: ReportSettings,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            runtime_seconds: runtime.as_secs_f64(),
            success_rate: tasks.success_rate(),
            tasks,
            sessions,
            data,
            settings,
        }
    }
}

/// Writes the report as pretty-printed JSON, creating parent directories
///
/// # Arguments
///
/// * `report` - The report to save
/// * `path` - Destination file
///
/// # Returns
///
/// * `Ok(())` - Report written
/// * `Err(GleanerError)` - Serialization or file I/O failed
pub fn write_report(report: &FinalReport, path: &Path) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(report)?;
    fs::write(path, json)?;
    Ok(())
}

/// Prints a short summary of the run to stdout
pub fn print_summary(report: &FinalReport) {
    println!();
    println!("{}", "=".repeat(60));
    println!("HARVEST COMPLETE - SUMMARY");
    println!("{}", "=".repeat(60));
    println!("Total runtime:   {:.2} seconds", report.runtime_seconds);
    println!("Targets:         {}", report.settings.target_keys.len());
    println!(
        "Tasks:           {} completed, {} failed, {} cancelled of {}",
        report.tasks.completed, report.tasks.failed, report.tasks.cancelled, report.tasks.total_tasks
    );
    println!("Retries:         {}", report.tasks.total_retries);
    println!("Records written: {}", report.data.total_written);
    println!("Duplicates:      {}", report.data.duplicates_skipped);
    println!("Success rate:    {:.1}%", report.success_rate);
    println!("Output:          {}", report.data.sink_location);

    if !report.tasks.failed_tasks.is_empty() {
        println!();
        println!("Failed targets:");
        for failed in &report.tasks.failed_tasks {
            println!(
                "  - {} after {} attempts: {}",
                failed.target_key,
                failed.attempts,
                failed.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!("{}", "=".repeat(60));
}
