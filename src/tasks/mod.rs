//! Task queue module
//!
//! One task is created per target key. The queue hands tasks to workers in
//! priority order, counts attempts, and re-enqueues failed attempts at High
//! priority until the attempt budget is spent.

mod queue;

pub use queue::TaskQueue;

use crate::crawler::FetchStats;
use crate::state::{TaskPriority, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A unit of work: harvest one target key
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub target_key: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of times the task has been started
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<FetchStats>,
    pub session_id: Option<String>,
    pub worker_id: Option<String>,
}

impl Task {
    /// Creates a Pending task with a fresh `task-xxxxxxxx` id
    pub fn new(target_key: &str, priority: TaskPriority, max_attempts: u32) -> Self {
        Self {
            id: new_task_id(),
            target_key: target_key.to_string(),
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts,
            last_error: None,
            result: None,
            session_id: None,
            worker_id: None,
        }
    }

    /// True while another attempt is allowed
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Seconds between start and completion of the final attempt
    pub fn completion_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

fn new_task_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("task-{}", &hex[..8])
}

/// A task that ended Failed, with the error that finished it
#[derive(Debug, Clone, Serialize)]
pub struct FailedTask {
    pub id: String,
    pub target_key: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub total_tasks: usize,
    pub by_status: BTreeMap<String, usize>,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_retries: u64,
    pub pending_count: usize,
    pub active_workers: usize,
    /// Mean start-to-completion time of completed tasks, in seconds
    pub average_completion_secs: f64,
    pub failed_tasks: Vec<FailedTask>,
}

impl TaskStats {
    /// Percentage of tasks that completed, 0 when there are none
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            0.0
        } else {
            self.completed as f64 / self.total_tasks as f64 * 100.0
        }
    }
}
