//! Crash recovery across process restarts, using on-disk stores

use crate::common::{test_config, ScriptedFetcher};
use gleaner::crawler::Orchestrator;
use gleaner::sessions::{Session, SessionRegistry};
use gleaner::state::SessionStatus;
use gleaner::storage::{CheckpointStore, SqliteCheckpointStore, SqliteRecordSink};
use std::path::Path;
use std::sync::Arc;

fn open_store(path: &str) -> Arc<SqliteCheckpointStore> {
    Arc::new(SqliteCheckpointStore::new(Path::new(path)).unwrap())
}

#[tokio::test]
async fn test_interrupted_session_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), &["Fiction"]);

    // First process: a session starts, reports a page, then the process dies
    let crashed_id = {
        let registry = SessionRegistry::new(open_store(&config.checkpoint.database_path), 2);
        let session = registry.try_admit("Fiction", "worker-0").unwrap();
        registry
            .update_progress(&session.id, Some(20), Some(1), Default::default())
            .unwrap();
        session.id
    };

    // Second process
    let store = open_store(&config.checkpoint.database_path);
    let sink = Arc::new(SqliteRecordSink::new(Path::new(&config.data.output_path)).unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new().titles("Fiction", &["Dune", "Emma"]));
    let orchestrator = Orchestrator::new(
        config,
        fetcher,
        store.clone(),
        sink,
        "hash".to_string(),
    )
    .unwrap();

    let before = orchestrator.registry().get(&crashed_id).unwrap();
    assert_eq!(before.status, SessionStatus::Recovering);
    assert_eq!(before.records_count, 20);
    assert!(before.worker_id.is_none());

    let report = orchestrator.run().await.unwrap();

    let resumed = orchestrator.registry().get(&crashed_id).unwrap();
    assert_eq!(resumed.status, SessionStatus::Completed);
    assert_eq!(resumed.retries, 1);
    assert_eq!(resumed.records_count, 2);

    // The recovered key was in this run's targets, so it ran once
    assert_eq!(report.tasks.total_tasks, 1);
    assert_eq!(report.sessions.total_sessions, 1);
    assert!(store.get_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_recovered_target_not_in_config_is_still_harvested() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["Fiction"]);
    config.scraping.max_concurrent_sessions = 1;

    {
        let store = open_store(&config.checkpoint.database_path);
        let mut crashed = Session::new("Poetry");
        crashed.status = SessionStatus::Running;
        store.put(&crashed).unwrap();
    }

    let store = open_store(&config.checkpoint.database_path);
    let sink = Arc::new(SqliteRecordSink::new(Path::new(&config.data.output_path)).unwrap());
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .titles("Fiction", &["Dune"])
            .titles("Poetry", &["Ariel"]),
    );
    let orchestrator =
        Orchestrator::new(config, fetcher.clone(), store, sink, "hash".to_string()).unwrap();

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.tasks.total_tasks, 2);
    assert_eq!(report.tasks.completed, 2);
    assert_eq!(report.data.by_target_key.get("Poetry"), Some(&1));
    // High priority puts the recovered key ahead of the configured one
    assert_eq!(fetcher.calls()[0].0, "Poetry");
}

#[tokio::test]
async fn test_failed_checkpoint_is_not_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), &["Fiction"]);

    let failed_id = {
        let store = open_store(&config.checkpoint.database_path);
        let mut failed = Session::new("Fiction");
        failed.status = SessionStatus::Failed;
        store.put(&failed).unwrap();
        failed.id
    };

    let registry = SessionRegistry::new(open_store(&config.checkpoint.database_path), 2);
    assert_eq!(
        registry.get(&failed_id).unwrap().status,
        SessionStatus::Failed
    );
    assert!(registry.recovering_sessions().is_empty());
}
