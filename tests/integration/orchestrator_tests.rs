//! End-to-end runs of the orchestrator against a scripted fetcher

use crate::common::{strings, test_config, ScriptedFetcher, Step};
use gleaner::crawler::Orchestrator;
use gleaner::state::{SessionStatus, TaskPriority, TaskStatus};
use gleaner::storage::{CheckpointStore, RecordSink, SqliteCheckpointStore, SqliteRecordSink};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    orchestrator: Orchestrator,
    fetcher: Arc<ScriptedFetcher>,
    store: Arc<SqliteCheckpointStore>,
    sink: Arc<SqliteRecordSink>,
}

fn harness(dir: &Path, keys: &[&str], fetcher: ScriptedFetcher) -> Harness {
    harness_with(test_config(dir, keys), fetcher)
}

fn harness_with(config: gleaner::Config, fetcher: ScriptedFetcher) -> Harness {
    let fetcher = Arc::new(fetcher);
    let store = Arc::new(
        SqliteCheckpointStore::new(Path::new(&config.checkpoint.database_path)).unwrap(),
    );
    let sink = Arc::new(SqliteRecordSink::new(Path::new(&config.data.output_path)).unwrap());
    let orchestrator = Orchestrator::new(
        config,
        fetcher.clone(),
        store.clone(),
        sink.clone(),
        "test-hash".to_string(),
    )
    .unwrap();

    Harness {
        orchestrator,
        fetcher,
        store,
        sink,
    }
}

#[tokio::test]
async fn test_all_targets_complete_and_records_written() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new()
        .titles("Fiction", &["Dune", "Emma", "Ulysses"])
        .titles("Mystery", &["Sharp Objects", "Rebecca"]);
    let h = harness(dir.path(), &["Fiction", "Mystery"], fetcher);

    let report = h.orchestrator.run().await.unwrap();

    assert_eq!(report.tasks.total_tasks, 2);
    assert_eq!(report.tasks.completed, 2);
    assert_eq!(report.tasks.total_retries, 0);
    assert!((report.success_rate - 100.0).abs() < f64::EPSILON);
    assert_eq!(report.data.total_received, 5);
    assert_eq!(report.data.total_written, 5);
    assert_eq!(report.data.buffer_size, 0);
    assert_eq!(report.data.by_target_key.get("Fiction"), Some(&3));
    assert_eq!(report.sessions.by_status.get("completed"), Some(&2));
    assert_eq!(report.settings.config_hash, "test-hash");

    assert_eq!(h.sink.count().unwrap(), 5);
    // Completed sessions leave no checkpoint behind
    assert!(h.store.get_all().unwrap().is_empty());

    let text = std::fs::read_to_string(dir.path().join("report.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["tasks"]["completed"], 2);
    assert_eq!(json["data"]["total_written"], 5);
}

#[tokio::test]
async fn test_failed_attempts_are_retried_at_high_priority() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new()
        .titles("Fiction", &["Dune"])
        .titles("Mystery", &["Rebecca", "Sharp Objects"])
        .script(
            "Mystery",
            vec![
                Step::Fail("connection reset".to_string()),
                Step::Fail("connection reset".to_string()),
            ],
        );
    let h = harness(dir.path(), &["Fiction", "Mystery"], fetcher);

    let report = h.orchestrator.run().await.unwrap();

    assert_eq!(report.tasks.completed, 2);
    assert_eq!(report.tasks.failed, 0);
    assert_eq!(report.tasks.total_retries, 2);
    assert_eq!(report.data.total_written, 3);

    let mystery = h
        .orchestrator
        .queue()
        .all_tasks()
        .into_iter()
        .find(|t| t.target_key == "Mystery")
        .unwrap();
    assert_eq!(mystery.status, TaskStatus::Completed);
    assert_eq!(mystery.attempts, 3);
    assert_eq!(mystery.priority, TaskPriority::High);
    assert_eq!(mystery.last_error.as_deref().map(|e| e.contains("connection reset")), Some(true));

    let mystery_calls: Vec<u32> = h
        .fetcher
        .calls()
        .into_iter()
        .filter(|(key, _)| key == "Mystery")
        .map(|(_, attempt)| attempt)
        .collect();
    assert_eq!(mystery_calls, vec![1, 2, 3]);

    // One session per attempt; failed ones keep their checkpoints
    let sessions: Vec<_> = h
        .orchestrator
        .registry()
        .all_sessions()
        .into_iter()
        .filter(|s| s.target_key == "Mystery")
        .collect();
    assert_eq!(sessions.len(), 3);
    let failed: Vec<_> = sessions
        .iter()
        .filter(|s| s.status == SessionStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|s| s.errors.len() == 1 && s.errors[0].kind == "fetch"));
    assert_eq!(h.store.get_all().unwrap().len(), 2);
}

#[tokio::test]
async fn test_exhausted_attempts_fail_permanently() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["Fiction", "Poetry"]);
    config.scraping.max_retries = 2;
    let fetcher = ScriptedFetcher::new()
        .titles("Fiction", &["Dune"])
        .script(
            "Poetry",
            vec![
                Step::Fail("timeout".to_string()),
                Step::Fail("timeout again".to_string()),
                Step::Succeed(strings(&["never reached"])),
            ],
        );
    let h = harness_with(config, fetcher);

    let report = h.orchestrator.run().await.unwrap();

    assert_eq!(report.tasks.completed, 1);
    assert_eq!(report.tasks.failed, 1);
    assert_eq!(report.tasks.total_retries, 1);
    assert!((report.success_rate - 50.0).abs() < f64::EPSILON);
    assert_eq!(report.tasks.failed_tasks.len(), 1);
    assert_eq!(report.tasks.failed_tasks[0].target_key, "Poetry");
    assert_eq!(report.tasks.failed_tasks[0].attempts, 2);
    assert_eq!(report.data.total_written, 1);
}

#[tokio::test]
async fn test_duplicate_titles_within_target_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new()
        .titles("Fiction", &["Dune", "Dune", "Emma"])
        .titles("Classics", &["Dune"]);
    let h = harness(dir.path(), &["Fiction", "Classics"], fetcher);

    let report = h.orchestrator.run().await.unwrap();

    // Same title under another target is a different record
    assert_eq!(report.data.total_written, 3);
    assert_eq!(report.data.duplicates_skipped, 1);
    assert_eq!(h.sink.count().unwrap(), 3);
}

#[tokio::test]
async fn test_running_sessions_never_exceed_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let keys = ["A", "B", "C", "D", "E", "F"];
    let mut fetcher = ScriptedFetcher::with_latency(Duration::from_millis(40));
    for key in keys {
        fetcher = fetcher.titles(key, &["only"]);
    }
    let h = harness(dir.path(), &keys, fetcher);

    let report = h.orchestrator.run().await.unwrap();

    assert_eq!(report.tasks.completed, 6);
    assert!(h.fetcher.max_in_flight() <= 2);
    assert!(h.fetcher.max_in_flight() >= 1);
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_work_and_cancels_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["A", "B", "C", "D"]);
    config.scraping.max_concurrent_sessions = 1;
    let fetcher = ScriptedFetcher::with_latency(Duration::from_millis(200))
        .titles("A", &["one"])
        .titles("B", &["two"])
        .titles("C", &["three"])
        .titles("D", &["four"]);
    let h = harness_with(config, fetcher);

    let token = h.orchestrator.shutdown_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let report = h.orchestrator.run().await.unwrap();

    // The fetch under way when shutdown arrived is allowed to finish
    assert_eq!(report.tasks.completed, 1);
    assert_eq!(report.tasks.cancelled, 3);
    assert_eq!(report.data.total_written, 1);
    assert_eq!(h.sink.count().unwrap(), 1);
    assert!(dir.path().join("report.json").exists());
}

#[tokio::test]
async fn test_stale_session_is_reaped_and_task_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["Fiction"]);
    config.scraping.session_timeout_secs = 1;
    let fetcher = ScriptedFetcher::new()
        .titles("Fiction", &["Dune"])
        .script(
            "Fiction",
            vec![Step::Slow(Duration::from_millis(1600), strings(&["Dune"]))],
        );
    let h = harness_with(config, fetcher);

    let report = h.orchestrator.run().await.unwrap();

    assert_eq!(report.tasks.completed, 1);
    assert_eq!(report.tasks.total_retries, 1);

    let sessions = h.orchestrator.registry().all_sessions();
    assert_eq!(sessions.len(), 2);
    let reaped = &sessions[0];
    assert_eq!(reaped.status, SessionStatus::Failed);
    assert_eq!(reaped.errors[0].kind, "timeout");
    assert_eq!(reaped.errors[0].message, "Session exceeded timeout of 1 seconds");
    assert_eq!(sessions[1].status, SessionStatus::Completed);

    // Records from the slow attempt were kept; the retry only added duplicates
    assert_eq!(report.data.total_written, 1);
    assert_eq!(report.data.duplicates_skipped, 1);
}

#[tokio::test]
async fn test_panicking_fetch_is_retried_without_stalling_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    // A is slow so that worker-0 is busy while worker-1 hits the panic
    let fetcher = ScriptedFetcher::new()
        .titles("A", &["Dune"])
        .titles("B", &["Emma"])
        .script("A", vec![Step::Slow(Duration::from_millis(200), strings(&["Dune"]))])
        .script("B", vec![Step::Panic("selector index out of range".to_string())]);
    let h = harness(dir.path(), &["A", "B"], fetcher);

    let report = tokio::time::timeout(Duration::from_secs(5), h.orchestrator.run())
        .await
        .expect("run finished after a worker's fetch panicked")
        .unwrap();

    assert_eq!(report.tasks.completed, 2);
    assert_eq!(report.tasks.total_retries, 1);
    assert_eq!(report.data.total_written, 2);

    let b = h
        .orchestrator
        .queue()
        .all_tasks()
        .into_iter()
        .find(|t| t.target_key == "B")
        .unwrap();
    assert_eq!(b.status, TaskStatus::Completed);
    assert_eq!(b.attempts, 2);
    assert!(b.last_error.unwrap().contains("selector index out of range"));

    let panicked: Vec<_> = h
        .orchestrator
        .registry()
        .all_sessions()
        .into_iter()
        .filter(|s| s.status == SessionStatus::Failed)
        .collect();
    assert_eq!(panicked.len(), 1);
    assert_eq!(panicked[0].target_key, "B");
    assert_eq!(panicked[0].errors[0].kind, "panic");
    assert!(h.orchestrator.registry().active_sessions().is_empty());
}
