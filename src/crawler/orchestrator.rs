//! Harvest orchestration
//!
//! This module contains the worker pool that ties the other components
//! together, including:
//! - Recovering sessions interrupted by a previous crash
//! - Seeding the task queue from the configured targets
//! - Running a fixed pool of workers behind the admission gate
//! - A monitor that logs progress and reaps stale sessions
//! - Graceful shutdown and the final report

use crate::aggregator::DataAggregator;
use crate::config::Config;
use crate::crawler::catalog::HttpCatalogFetcher;
use crate::crawler::fetcher::{FetchContext, FetchOutput, PageFetcher, ProgressObserver};
use crate::output::{print_summary, write_report, FinalReport, ReportSettings};
use crate::sessions::{Session, SessionRegistry};
use crate::state::TaskPriority;
use crate::storage::{CheckpointStore, RecordSink, SqliteCheckpointStore, SqliteRecordSink};
use crate::tasks::{Task, TaskQueue};
use crate::GleanerError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// State every worker and the monitor share
#[derive(Clone)]
struct Shared {
    queue: Arc<TaskQueue>,
    registry: Arc<SessionRegistry>,
    aggregator: Arc<DataAggregator>,
    fetcher: Arc<dyn PageFetcher>,
    /// Recovered sessions waiting for a worker, by target key
    resumable: Arc<Mutex<HashMap<String, String>>>,
    shutdown: CancellationToken,
    admission_backoff: Duration,
    dequeue_timeout: Duration,
    retry_delay: Duration,
}

impl Shared {
    fn resumable(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.resumable.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps unless shutdown is requested first; returns false on shutdown
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Runs a bounded pool of harvest workers over the configured targets
pub struct Orchestrator {
    config: Arc<Config>,
    config_hash: String,
    shared: Shared,
}

impl Orchestrator {
    /// Wires the queue, registry, and aggregator together
    ///
    /// Building the registry loads existing checkpoints, so sessions from a
    /// crashed run are already Recovering when this returns.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration
    /// * `fetcher` - Collaborator that harvests one target key
    /// * `store` - Durable checkpoint store
    /// * `sink` - Durable append-only record sink
    /// * `config_hash` - Hash recorded in the final report
    ///
    /// # Returns
    ///
    /// * `Ok(Orchestrator)` - Ready to run
    /// * `Err(GleanerError)` - The sink could not be initialized
    pub fn new(
        config: Config,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn CheckpointStore>,
        sink: Arc<dyn RecordSink>,
        config_hash: String,
    ) -> crate::Result<Self> {
        let aggregator = DataAggregator::new(
            sink,
            config.data.columns(),
            config.data.buffer_size,
            config.data.write_interval(),
        )?;

        let shared = Shared {
            queue: Arc::new(TaskQueue::new(config.scraping.max_retries)),
            registry: Arc::new(SessionRegistry::new(
                store,
                config.scraping.max_concurrent_sessions,
            )),
            aggregator: Arc::new(aggregator),
            fetcher,
            resumable: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            admission_backoff: config.monitor.admission_backoff(),
            dequeue_timeout: config.monitor.dequeue_timeout(),
            retry_delay: config.scraping.retry_delay(),
        };

        Ok(Self {
            config: Arc::new(config),
            config_hash,
            shared,
        })
    }

    /// Token that stops the run when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.shared.queue
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    pub fn aggregator(&self) -> &Arc<DataAggregator> {
        &self.shared.aggregator
    }

    /// Moves Recovering sessions back to Pending, one per target key
    ///
    /// When a key has several recovered sessions the newest is kept and the
    /// rest are cancelled.
    ///
    /// # Returns
    ///
    /// Target keys that have a session to resume
    pub fn recover_sessions(&self) -> Vec<String> {
        let registry = &self.shared.registry;
        let mut keys = Vec::new();

        // Oldest first, so a later session for the same key replaces an earlier one
        for session in registry.recovering_sessions() {
            let recovered = match registry.recover(&session.id) {
                Ok(Some(recovered)) => recovered,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(session = %session.id, "Failed to recover session: {}", e);
                    continue;
                }
            };

            let replaced = self
                .shared
                .resumable()
                .insert(recovered.target_key.clone(), recovered.id.clone());

            match replaced {
                Some(older) => {
                    if let Err(e) = registry.cancel(&older) {
                        tracing::warn!(session = %older, "Failed to cancel superseded session: {}", e);
                    }
                }
                None => keys.push(recovered.target_key.clone()),
            }

            tracing::info!(
                session = %recovered.id,
                target = %recovered.target_key,
                retries = recovered.retries,
                "Recovered interrupted session"
            );
        }

        keys
    }

    /// Enqueues one task per configured target plus recovered keys
    ///
    /// Recovered keys outside this run's targets go in at High priority;
    /// the rest at Normal.
    ///
    /// # Returns
    ///
    /// Number of tasks enqueued
    pub fn seed(&self, recovered: &[String]) -> usize {
        let targets = self.config.target_keys();
        let configured: HashSet<&str> = targets.iter().map(String::as_str).collect();

        let mut count = 0;
        for key in recovered {
            if configured.contains(key.as_str()) {
                tracing::info!(target = %key, "Recovered target is already scheduled");
            } else {
                self.shared.queue.enqueue(key, TaskPriority::High);
                count += 1;
            }
        }

        count += self
            .shared
            .queue
            .enqueue_all(&targets, TaskPriority::Normal)
            .len();
        count
    }

    /// Runs the harvest to completion or until shutdown is requested
    ///
    /// # Returns
    ///
    /// * `Ok(FinalReport)` - Workers finished and the aggregator drained
    pub async fn run(&self) -> crate::Result<FinalReport> {
        let started = Instant::now();

        let recovered = self.recover_sessions();
        let tasks = self.seed(&recovered);
        self.shared.aggregator.start();

        let pool_size = self.config.scraping.max_concurrent_sessions;
        tracing::info!("Starting {} workers for {} tasks", pool_size, tasks);

        let mut workers = JoinSet::new();
        for i in 0..pool_size {
            let worker_id = format!("worker-{}", i);
            let handle = tokio::spawn(worker_loop(self.shared.clone(), worker_id.clone()));
            workers.spawn(async move { (worker_id, handle.await) });
        }

        let monitor_stop = self.shared.shutdown.child_token();
        let monitor = tokio::spawn(monitor_loop(
            self.shared.clone(),
            monitor_stop.clone(),
            self.config.monitor.interval(),
            self.config.scraping.session_timeout(),
            started,
        ));

        // Joined in exit order so a dead worker's tasks are released while
        // the others are still running
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((worker_id, Err(e))) => self.release_worker(&worker_id, &e),
                Err(e) => tracing::error!("Worker supervisor failed: {}", e),
            }
        }

        if self.shared.shutdown.is_cancelled() {
            let cancelled = self.shared.queue.cancel_all();
            if cancelled > 0 {
                tracing::info!("Cancelled {} unfinished tasks", cancelled);
            }
        }

        monitor_stop.cancel();
        if let Err(e) = monitor.await {
            tracing::error!("Monitor panicked: {}", e);
        }

        match self.shared.aggregator.stop().await {
            Ok(flushed) => tracing::debug!("Final drain wrote {} records", flushed),
            Err(e) => tracing::error!("Final drain failed: {}", e),
        }

        let report = self.final_report(started.elapsed());
        if let Err(e) = write_report(&report, Path::new(&self.config.data.report_path)) {
            tracing::error!("Failed to write final report: {}", e);
        } else {
            tracing::info!("Final report saved to {}", self.config.data.report_path);
        }

        tracing::info!(
            "Orchestrator shutdown complete. Total runtime: {:.2}s",
            report.runtime_seconds
        );
        Ok(report)
    }

    fn release_worker(&self, worker_id: &str, error: &JoinError) {
        let message = format!("Worker {} exited: {}", worker_id, error);
        let tasks = self.shared.queue.release_worker(worker_id);
        let sessions = self.shared.registry.release_worker(worker_id, &message);
        tracing::error!(
            worker = %worker_id,
            "{}; released {} tasks and {} sessions",
            message,
            tasks.len(),
            sessions.len()
        );
    }

    /// Snapshot of every component's counters
    pub fn final_report(&self, runtime: Duration) -> FinalReport {
        let settings = ReportSettings {
            target_keys: self.config.target_keys(),
            max_concurrent_sessions: self.config.scraping.max_concurrent_sessions,
            max_pages_per_target: self.config.scraping.max_pages_per_target,
            config_hash: self.config_hash.clone(),
        };

        FinalReport::new(
            runtime,
            self.shared.queue.stats(),
            self.shared.registry.stats(),
            self.shared.aggregator.stats(),
            settings,
        )
    }
}

/// One worker: admission check, dequeue, run the task, repeat
async fn worker_loop(shared: Shared, worker_id: String) {
    tracing::info!(worker = %worker_id, "Worker started");

    while !shared.shutdown.is_cancelled() {
        if !shared.registry.can_admit() {
            if !shared.pause(shared.admission_backoff).await {
                break;
            }
            continue;
        }

        let dequeued = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            task = shared.queue.dequeue(&worker_id, shared.dequeue_timeout) => task,
        };

        let task = match dequeued {
            Some(task) => task,
            None if shared.queue.has_outstanding_work() => continue,
            None => break,
        };

        let Some(session) = acquire_session(&shared, &task, &worker_id) else {
            if let Err(e) = shared.queue.requeue(&task.id) {
                tracing::error!(worker = %worker_id, task_id = %task.id, "Failed to requeue task: {}", e);
            }
            if !shared.pause(shared.admission_backoff).await {
                break;
            }
            continue;
        };

        if let Err(e) = run_contained(&shared, &task, &session, &worker_id).await {
            let message = format!("Failed to process {}: {}", task.target_key, e);
            tracing::error!(worker = %worker_id, session = %session.id, "{}", message);

            if let Err(qe) = shared.queue.fail(&task.id, &message, true) {
                tracing::error!(task_id = %task.id, "Failed to record task failure: {}", qe);
            }
            // Already Failed if the monitor reaped it
            if let Err(se) = shared.registry.fail(&session.id, e.kind(), &message) {
                tracing::debug!(session = %session.id, "Session not failed: {}", se);
            }

            if !shared.pause(shared.retry_delay).await {
                break;
            }
        }
    }

    tracing::info!(worker = %worker_id, "Worker stopped");
}

/// Runs one task on its own tokio task so a panic fails only that attempt
async fn run_contained(
    shared: &Shared,
    task: &Task,
    session: &Session,
    worker_id: &str,
) -> crate::Result<()> {
    let handle = {
        let shared = shared.clone();
        let task = task.clone();
        let session = session.clone();
        let worker_id = worker_id.to_string();
        tokio::spawn(async move { run_task(&shared, &task, &session, &worker_id).await })
    };

    match handle.await {
        Ok(result) => result,
        Err(e) => Err(GleanerError::Panicked(panic_message(e))),
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Starts a recovered session for the task's key, or admits a new one
///
/// Returns None when the concurrency ceiling is reached.
fn acquire_session(shared: &Shared, task: &Task, worker_id: &str) -> Option<Session> {
    let resumable = shared.resumable().remove(&task.target_key);

    if let Some(session_id) = resumable {
        match shared.registry.start(&session_id, worker_id) {
            Ok(session) => return Some(session),
            Err(GleanerError::AdmissionDenied { .. }) => {
                shared.resumable().insert(task.target_key.clone(), session_id);
                return None;
            }
            Err(e) => {
                tracing::warn!(session = %session_id, "Cannot resume session: {}", e);
            }
        }
    }

    shared.registry.try_admit(&task.target_key, worker_id)
}

/// Fetches one target under an admitted session and reports the outcome
async fn run_task(
    shared: &Shared,
    task: &Task,
    session: &Session,
    worker_id: &str,
) -> crate::Result<()> {
    let task = shared.queue.start(&task.id, &session.id)?;

    let observer: Arc<dyn ProgressObserver> = shared.registry.clone();
    let ctx = FetchContext::new(&session.id, worker_id, &task.target_key, task.attempts)
        .with_progress(observer);

    tracing::info!(
        worker = %worker_id,
        session = %session.id,
        attempt = task.attempts,
        "Processing {}",
        task.target_key
    );

    let span = ctx.span();
    let FetchOutput { records, stats } = shared.fetcher.fetch(&ctx).instrument(span).await?;

    let outcome = shared.aggregator.ingest(records, &session.id);
    shared.registry.update_progress(
        &session.id,
        Some(stats.records_scraped),
        Some(stats.pages_scraped),
        BTreeMap::new(),
    )?;

    // Session first: a session reaped mid-fetch fails the attempt
    shared.registry.complete(&session.id, &stats)?;
    shared.queue.complete(&task.id, stats.clone())?;

    tracing::info!(
        worker = %worker_id,
        "Completed {}: {} records ({} new) in {:.2}s",
        task.target_key,
        stats.records_scraped,
        outcome.accepted,
        stats.duration_secs
    );
    Ok(())
}

/// Logs aggregate progress and reaps stale sessions until stopped
async fn monitor_loop(
    shared: Shared,
    stop: CancellationToken,
    interval: Duration,
    session_timeout: Duration,
    started: Instant,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let sessions = shared.registry.stats();
        let tasks = shared.queue.stats();
        let data = shared.aggregator.stats();

        tracing::info!(
            "Progress: runtime {}s | active {} | completed {}/{} | written {} | buffered {}",
            started.elapsed().as_secs(),
            sessions.active_sessions,
            tasks.completed,
            tasks.total_tasks,
            data.total_written,
            data.buffer_size
        );

        let reaped = shared.registry.cleanup_stale(session_timeout);
        if !reaped.is_empty() {
            tracing::warn!("Reaped {} stale sessions: {:?}", reaped.len(), reaped);
        }
    }
}

/// Waits for Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Runs a complete harvest against the configured catalog
///
/// # Arguments
///
/// * `config` - Validated configuration
/// * `config_hash` - Hash of the configuration file
/// * `fresh` - Discard checkpoints left by previous runs
///
/// # Returns
///
/// * `Ok(FinalReport)` - Harvest finished or was shut down cleanly
/// * `Err(GleanerError)` - Stores or sink could not be opened
pub async fn run_crawl(
    config: Config,
    config_hash: String,
    fresh: bool,
) -> crate::Result<FinalReport> {
    let store = SqliteCheckpointStore::new(Path::new(&config.checkpoint.database_path))?;
    if fresh {
        let cleared = store.clear()?;
        tracing::info!("Cleared {} checkpoints from previous runs", cleared);
    }

    let sink = SqliteRecordSink::new(Path::new(&config.data.output_path))?;
    let fetcher = HttpCatalogFetcher::new(&config)?;

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(fetcher),
        Arc::new(store),
        Arc::new(sink),
        config_hash,
    )?;

    let token = orchestrator.shutdown_token();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Received shutdown signal, finishing in-flight work...");
        token.cancel();
    });

    let report = orchestrator.run().await;
    signal_task.abort();

    let report = report?;
    print_summary(&report);
    Ok(report)
}
