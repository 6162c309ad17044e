//! In-process priority task queue
//!
//! Pending tasks live in a single ordered map keyed by `(priority, sequence)`,
//! so the first entry is always the highest-priority, oldest task.

use crate::crawler::FetchStats;
use crate::state::{TaskPriority, TaskStatus};
use crate::tasks::{FailedTask, Task, TaskStats};
use crate::{GleanerError, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Poll interval used by `await_drain`
const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, Task>,
    pending: BTreeMap<(TaskPriority, u64), String>,
    /// Pending-map key of every Pending task, for O(log n) removal
    pending_keys: HashMap<String, (TaskPriority, u64)>,
    next_seq: u64,
    total_retries: u64,
}

impl QueueState {
    fn push_pending(&mut self, task_id: &str, priority: TaskPriority) {
        let key = (priority, self.next_seq);
        self.next_seq += 1;
        self.pending.insert(key, task_id.to_string());
        self.pending_keys.insert(task_id.to_string(), key);
    }

    fn remove_pending(&mut self, task_id: &str) {
        if let Some(key) = self.pending_keys.remove(task_id) {
            self.pending.remove(&key);
        }
    }

    fn task_mut(&mut self, task_id: &str) -> Result<&mut Task> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| GleanerError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            })
    }
}

fn invalid_transition(task: &Task, to: TaskStatus) -> GleanerError {
    GleanerError::InvalidTransition {
        kind: "task",
        id: task.id.clone(),
        from: task.status.to_string(),
        to: to.to_string(),
    }
}

/// Thread-safe priority queue of harvest tasks
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Notify,
    max_attempts: u32,
}

impl TaskQueue {
    /// Creates an empty queue
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Attempt budget given to every enqueued task
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            max_attempts,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a new Pending task for `target_key`
    pub fn enqueue(&self, target_key: &str, priority: TaskPriority) -> Task {
        let task = Task::new(target_key, priority, self.max_attempts);
        {
            let mut state = self.lock();
            state.tasks.insert(task.id.clone(), task.clone());
            state.push_pending(&task.id, priority);
        }
        self.available.notify_waiters();

        tracing::debug!(task_id = %task.id, target = %target_key, %priority, "Task enqueued");
        task
    }

    /// Enqueues one task per key, preserving the given order within the priority
    pub fn enqueue_all<S: AsRef<str>>(&self, target_keys: &[S], priority: TaskPriority) -> Vec<Task> {
        target_keys
            .iter()
            .map(|key| self.enqueue(key.as_ref(), priority))
            .collect()
    }

    /// Pops the highest-priority pending task and assigns it to `worker_id`
    ///
    /// Waits up to `wait` for a task to appear. Returns `None` when the wait
    /// elapses with nothing pending.
    pub async fn dequeue(&self, worker_id: &str, wait: Duration) -> Option<Task> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so an enqueue in between is not missed
            notified.as_mut().enable();

            if let Some(task) = self.try_assign(worker_id) {
                return Some(task);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Non-blocking variant of `dequeue`
    pub fn try_assign(&self, worker_id: &str) -> Option<Task> {
        let mut state = self.lock();
        let (_, task_id) = state.pending.pop_first()?;
        state.pending_keys.remove(&task_id);

        let task = state.tasks.get_mut(&task_id)?;
        task.status = TaskStatus::Assigned;
        task.assigned_at = Some(Utc::now());
        task.worker_id = Some(worker_id.to_string());

        tracing::debug!(task_id = %task.id, worker = %worker_id, "Task assigned");
        Some(task.clone())
    }

    /// Marks a task Running under `session_id` and counts the attempt
    pub fn start(&self, task_id: &str, session_id: &str) -> Result<Task> {
        let mut state = self.lock();
        let status = state.task_mut(task_id)?.status;

        match status {
            TaskStatus::Assigned => {}
            TaskStatus::Pending => state.remove_pending(task_id),
            _ => return Err(invalid_transition(state.task_mut(task_id)?, TaskStatus::Running)),
        }

        let task = state.task_mut(task_id)?;
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.started_at = Some(Utc::now());
        task.session_id = Some(session_id.to_string());

        tracing::debug!(
            task_id = %task.id,
            session = %session_id,
            attempt = task.attempts,
            "Task started"
        );
        Ok(task.clone())
    }

    /// Marks a Running task Completed and stores its result
    pub fn complete(&self, task_id: &str, result: FetchStats) -> Result<Task> {
        let mut state = self.lock();
        let task = state.task_mut(task_id)?;

        if task.status != TaskStatus::Running {
            return Err(invalid_transition(task, TaskStatus::Completed));
        }

        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.result = Some(result);

        tracing::info!(
            task_id = %task.id,
            target = %task.target_key,
            attempts = task.attempts,
            "Task completed"
        );
        Ok(task.clone())
    }

    /// Records a failed attempt
    ///
    /// With `retry` set and attempts left, the task goes back to Pending at
    /// High priority. Otherwise it becomes Failed. `last_error` is kept
    /// either way.
    pub fn fail(&self, task_id: &str, error: &str, retry: bool) -> Result<Task> {
        let (task, requeued) = {
            let mut state = self.lock();
            let task = state.task_mut(task_id)?;

            if !task.status.is_in_flight() {
                return Err(invalid_transition(task, TaskStatus::Failed));
            }

            task.last_error = Some(error.to_string());

            if retry && task.can_retry() {
                task.status = TaskStatus::Pending;
                task.priority = TaskPriority::High;
                task.assigned_at = None;
                task.started_at = None;
                task.worker_id = None;
                task.session_id = None;
                let snapshot = task.clone();

                state.total_retries += 1;
                state.push_pending(task_id, TaskPriority::High);

                tracing::warn!(
                    task_id = %task_id,
                    target = %snapshot.target_key,
                    attempt = snapshot.attempts,
                    max_attempts = snapshot.max_attempts,
                    "Task attempt failed, re-queued: {}",
                    error
                );
                (snapshot, true)
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());

                tracing::error!(
                    task_id = %task.id,
                    target = %task.target_key,
                    attempts = task.attempts,
                    "Task failed permanently: {}",
                    error
                );
                (task.clone(), false)
            }
        };

        if requeued {
            self.available.notify_waiters();
        }
        Ok(task)
    }

    /// Returns an assigned task to Pending without counting a retry
    ///
    /// Used when a worker dequeued a task but could not get a session for it.
    pub fn requeue(&self, task_id: &str) -> Result<Task> {
        let task = {
            let mut state = self.lock();
            let task = state.task_mut(task_id)?;

            if task.status != TaskStatus::Assigned {
                return Err(invalid_transition(task, TaskStatus::Pending));
            }

            task.status = TaskStatus::Pending;
            task.assigned_at = None;
            task.worker_id = None;
            let snapshot = task.clone();
            state.push_pending(task_id, snapshot.priority);
            snapshot
        };

        self.available.notify_waiters();
        Ok(task)
    }

    /// Returns every task held by `worker_id` to the queue
    ///
    /// Assigned tasks go back to Pending as if never dequeued. Running tasks
    /// count as a failed attempt and follow the retry policy.
    ///
    /// # Returns
    ///
    /// Ids of the tasks that were released
    pub fn release_worker(&self, worker_id: &str) -> Vec<String> {
        let held: Vec<(String, TaskStatus)> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.status.is_in_flight() && t.worker_id.as_deref() == Some(worker_id))
            .map(|t| (t.id.clone(), t.status))
            .collect();

        let message = format!("Worker {} exited mid-task", worker_id);
        held.into_iter()
            .filter_map(|(id, status)| {
                let released = match status {
                    TaskStatus::Assigned => self.requeue(&id),
                    _ => self.fail(&id, &message, true),
                };
                released.ok().map(|_| id)
            })
            .collect()
    }

    /// Cancels a task that has not reached a terminal state
    pub fn cancel(&self, task_id: &str) -> Result<Task> {
        let mut state = self.lock();
        let task = state.task_mut(task_id)?;

        if task.status.is_terminal() {
            return Err(invalid_transition(task, TaskStatus::Cancelled));
        }

        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        let snapshot = task.clone();
        state.remove_pending(task_id);

        tracing::info!(task_id = %task_id, target = %snapshot.target_key, "Task cancelled");
        Ok(snapshot)
    }

    /// Cancels every non-terminal task, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = {
            let state = self.lock();
            state
                .tasks
                .values()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.id.clone())
                .collect()
        };

        ids.iter().filter(|id| self.cancel(id).is_ok()).count()
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.lock().tasks.get(task_id).cloned()
    }

    /// Tasks currently owned by a worker
    pub fn active_tasks(&self) -> Vec<Task> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.status.is_in_flight())
            .cloned()
            .collect()
    }

    /// Every task this queue has seen, oldest first
    pub fn all_tasks(&self) -> Vec<Task> {
        let mut list: Vec<Task> = self.lock().tasks.values().cloned().collect();
        list.sort_by_key(|t| t.created_at);
        list
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of tasks Assigned or Running
    pub fn in_flight_count(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.status.is_in_flight())
            .count()
    }

    /// True while any task is Pending, Assigned, or Running
    pub fn has_outstanding_work(&self) -> bool {
        self.lock().tasks.values().any(|t| t.status.is_active())
    }

    /// Builds a snapshot of queue counters
    pub fn stats(&self) -> TaskStats {
        let state = self.lock();

        let mut by_status: BTreeMap<String, usize> = TaskStatus::all_states()
            .into_iter()
            .map(|s| (s.to_db_string().to_string(), 0))
            .collect();
        let mut workers = HashSet::new();
        let mut completion_total = 0.0;
        let mut completion_count = 0usize;
        let mut failed_tasks = Vec::new();

        for task in state.tasks.values() {
            *by_status
                .entry(task.status.to_db_string().to_string())
                .or_insert(0) += 1;

            if task.status.is_in_flight() {
                if let Some(worker) = &task.worker_id {
                    workers.insert(worker.clone());
                }
            }

            match task.status {
                TaskStatus::Completed => {
                    if let Some(secs) = task.completion_secs() {
                        completion_total += secs;
                        completion_count += 1;
                    }
                }
                TaskStatus::Failed => failed_tasks.push(FailedTask {
                    id: task.id.clone(),
                    target_key: task.target_key.clone(),
                    attempts: task.attempts,
                    last_error: task.last_error.clone(),
                }),
                _ => {}
            }
        }

        failed_tasks.sort_by(|a, b| a.target_key.cmp(&b.target_key));

        let average_completion_secs = if completion_count == 0 {
            0.0
        } else {
            (completion_total / completion_count as f64 * 100.0).round() / 100.0
        };

        let count = |s: TaskStatus| by_status.get(s.to_db_string()).copied().unwrap_or(0);

        TaskStats {
            total_tasks: state.tasks.len(),
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            cancelled: count(TaskStatus::Cancelled),
            total_retries: state.total_retries,
            pending_count: state.pending.len(),
            active_workers: workers.len(),
            average_completion_secs,
            failed_tasks,
            by_status,
        }
    }

    /// Waits until no task is Pending, Assigned, or Running
    ///
    /// Returns false if `timeout` elapses first. With no timeout this waits
    /// for as long as it takes.
    pub async fn await_drain(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if !self.has_outstanding_work() {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}
