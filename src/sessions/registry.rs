//! Session registry: lifecycle, checkpoints, and crash recovery

use crate::crawler::{FetchStats, ProgressObserver};
use crate::sessions::{PayloadValue, Session, SessionError, SessionStats};
use crate::state::SessionStatus;
use crate::storage::CheckpointStore;
use crate::{GleanerError, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn not_found(session_id: &str) -> GleanerError {
    GleanerError::NotFound {
        kind: "session",
        id: session_id.to_string(),
    }
}

fn invalid_transition(session: &Session, to: SessionStatus) -> GleanerError {
    GleanerError::InvalidTransition {
        kind: "session",
        id: session.id.clone(),
        from: session.status.to_string(),
        to: to.to_string(),
    }
}

/// Owns every session of the run and the concurrency ceiling
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    store: Arc<dyn CheckpointStore>,
    max_concurrent: usize,
}

impl SessionRegistry {
    /// Creates a registry and reloads checkpoints left by earlier runs
    ///
    /// Sessions checkpointed while Pending, Initializing, or Running come
    /// back as Recovering. A store that cannot be read is logged and treated
    /// as empty.
    ///
    /// # Arguments
    ///
    /// * `store` - Checkpoint persistence
    /// * `max_concurrent` - Ceiling on simultaneously Running sessions
    pub fn new(store: Arc<dyn CheckpointStore>, max_concurrent: usize) -> Self {
        let registry = Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            max_concurrent,
        };
        registry.load_checkpoints();
        registry
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_checkpoints(&self) {
        let loaded = match self.store.get_all() {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!("Failed to load session checkpoints: {}", e);
                return;
            }
        };

        let mut sessions = self.lock();
        let mut recovering = 0;
        for mut session in loaded {
            if session.status.is_interrupted() {
                session.status = SessionStatus::Recovering;
                session.worker_id = None;
                self.checkpoint(&mut session);
                recovering += 1;
            }
            sessions.insert(session.id.clone(), session);
        }

        if !sessions.is_empty() {
            tracing::info!(
                "Loaded {} session checkpoints ({} to recover)",
                sessions.len(),
                recovering
            );
        }
    }

    /// Persists a session, stamping `last_checkpoint_at`; failures are only logged
    fn checkpoint(&self, session: &mut Session) {
        session.last_checkpoint_at = Some(Utc::now());
        if let Err(e) = self.store.put(session) {
            tracing::error!(session = %session.id, "Failed to save checkpoint: {}", e);
        }
    }

    fn running_in(sessions: &HashMap<String, Session>) -> usize {
        sessions
            .values()
            .filter(|s| s.status == SessionStatus::Running)
            .count()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of sessions currently Running
    pub fn running_count(&self) -> usize {
        Self::running_in(&self.lock())
    }

    /// True while another session may start without exceeding the ceiling
    pub fn can_admit(&self) -> bool {
        self.running_count() < self.max_concurrent
    }

    /// Registers a new Pending session for `target_key`
    pub fn create(&self, target_key: &str) -> Session {
        let mut session = Session::new(target_key);
        let mut sessions = self.lock();
        self.checkpoint(&mut session);
        sessions.insert(session.id.clone(), session.clone());

        tracing::debug!(session = %session.id, target = %target_key, "Session created");
        session
    }

    /// Creates and starts a session in one step if the ceiling allows
    ///
    /// Returns `None` when the ceiling is already reached. The check and the
    /// transition to Running happen under one lock, so concurrent callers
    /// cannot overshoot the ceiling.
    pub fn try_admit(&self, target_key: &str, worker_id: &str) -> Option<Session> {
        let mut sessions = self.lock();
        if Self::running_in(&sessions) >= self.max_concurrent {
            return None;
        }

        let mut session = Session::new(target_key);
        session.status = SessionStatus::Running;
        session.started_at = Some(Utc::now());
        session.worker_id = Some(worker_id.to_string());
        self.checkpoint(&mut session);
        sessions.insert(session.id.clone(), session.clone());

        tracing::info!(
            session = %session.id,
            worker = %worker_id,
            target = %target_key,
            "Session started"
        );
        Some(session)
    }

    /// Pending → Initializing
    pub fn mark_initializing(&self, session_id: &str) -> Result<Session> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;

        if session.status != SessionStatus::Pending {
            return Err(invalid_transition(session, SessionStatus::Initializing));
        }

        session.status = SessionStatus::Initializing;
        self.checkpoint(session);
        Ok(session.clone())
    }

    /// Pending or Initializing → Running under `worker_id`
    ///
    /// Fails with `AdmissionDenied` when the ceiling is already reached.
    pub fn start(&self, session_id: &str, worker_id: &str) -> Result<Session> {
        let mut sessions = self.lock();
        let running = Self::running_in(&sessions);
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;

        if !matches!(
            session.status,
            SessionStatus::Pending | SessionStatus::Initializing
        ) {
            return Err(invalid_transition(session, SessionStatus::Running));
        }

        if running >= self.max_concurrent {
            return Err(GleanerError::AdmissionDenied {
                running,
                limit: self.max_concurrent,
            });
        }

        session.status = SessionStatus::Running;
        session.started_at = Some(Utc::now());
        session.worker_id = Some(worker_id.to_string());
        self.checkpoint(session);

        tracing::info!(session = %session_id, worker = %worker_id, "Session started");
        Ok(session.clone())
    }

    /// Sets progress counters to their latest values and merges `extra` into the payload
    ///
    /// Counters are overwritten, never incremented, so repeating a call is harmless.
    pub fn update_progress(
        &self,
        session_id: &str,
        records: Option<usize>,
        pages: Option<usize>,
        extra: BTreeMap<String, PayloadValue>,
    ) -> Result<Session> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;

        if session.status.is_terminal() {
            return Err(invalid_transition(session, session.status));
        }

        if let Some(records) = records {
            session.records_count = records;
        }
        if let Some(pages) = pages {
            session.pages_count = pages;
        }
        session.checkpoint_payload.extend(extra);
        self.checkpoint(session);

        Ok(session.clone())
    }

    /// Running → Completed; the checkpoint is deleted
    pub fn complete(&self, session_id: &str, stats: &FetchStats) -> Result<Session> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;

        if session.status != SessionStatus::Running {
            return Err(invalid_transition(session, SessionStatus::Completed));
        }

        session.status = SessionStatus::Completed;
        session.completed_at = Some(Utc::now());
        session.records_count = stats.records_scraped;
        session.pages_count = stats.pages_scraped;
        session
            .checkpoint_payload
            .insert("duration_secs".to_string(), stats.duration_secs.into());

        if let Err(e) = self.store.delete(session_id) {
            tracing::error!(session = %session_id, "Failed to delete checkpoint: {}", e);
        }

        tracing::info!(
            session = %session_id,
            records = stats.records_scraped,
            pages = stats.pages_scraped,
            "Session completed"
        );
        Ok(session.clone())
    }

    /// Any non-terminal state → Failed, appending to the error log
    ///
    /// The checkpoint is kept for post-mortem inspection.
    pub fn fail(&self, session_id: &str, kind: &str, message: &str) -> Result<Session> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;

        if session.status.is_terminal() {
            return Err(invalid_transition(session, SessionStatus::Failed));
        }

        Self::fail_in_place(session, kind, message);
        self.checkpoint(session);

        tracing::warn!(session = %session_id, kind = %kind, "Session failed: {}", message);
        Ok(session.clone())
    }

    fn fail_in_place(session: &mut Session, kind: &str, message: &str) {
        let now = Utc::now();
        session.status = SessionStatus::Failed;
        session.completed_at = Some(now);
        session.errors.push(SessionError {
            timestamp: now,
            kind: kind.to_string(),
            message: message.to_string(),
        });
    }

    /// Any non-terminal state → Cancelled; the checkpoint is deleted
    pub fn cancel(&self, session_id: &str) -> Result<Session> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;

        if session.status.is_terminal() {
            return Err(invalid_transition(session, SessionStatus::Cancelled));
        }

        session.status = SessionStatus::Cancelled;
        session.completed_at = Some(Utc::now());
        if let Err(e) = self.store.delete(session_id) {
            tracing::error!(session = %session_id, "Failed to delete checkpoint: {}", e);
        }

        tracing::info!(session = %session_id, "Session cancelled");
        Ok(session.clone())
    }

    /// Force-fails Running sessions older than `timeout`
    ///
    /// # Returns
    ///
    /// Ids of the sessions that were reaped
    pub fn cleanup_stale(&self, timeout: Duration) -> Vec<String> {
        let now = Utc::now();
        let limit = timeout.as_secs_f64();
        let message = format!("Session exceeded timeout of {} seconds", timeout.as_secs());

        let mut reaped = Vec::new();
        let mut sessions = self.lock();
        for session in sessions.values_mut() {
            if session.status != SessionStatus::Running {
                continue;
            }
            let stale = session
                .runtime_secs(now)
                .map(|runtime| runtime > limit)
                .unwrap_or(false);

            if stale {
                Self::fail_in_place(session, "timeout", &message);
                self.checkpoint(session);
                tracing::warn!(session = %session.id, "Cleaned up stale session");
                reaped.push(session.id.clone());
            }
        }

        reaped
    }

    /// Fails every live session held by a worker that died
    ///
    /// # Returns
    ///
    /// Ids of the sessions that were failed
    pub fn release_worker(&self, worker_id: &str, message: &str) -> Vec<String> {
        let mut released = Vec::new();
        let mut sessions = self.lock();
        for session in sessions.values_mut() {
            let held = matches!(
                session.status,
                SessionStatus::Initializing | SessionStatus::Running
            ) && session.worker_id.as_deref() == Some(worker_id);

            if held {
                Self::fail_in_place(session, "panic", message);
                self.checkpoint(session);
                tracing::warn!(session = %session.id, worker = %worker_id, "Released session of dead worker");
                released.push(session.id.clone());
            }
        }
        released
    }

    /// Recovering → Pending, counting a retry
    ///
    /// Returns `Ok(None)` when the session exists but is not Recovering.
    pub fn recover(&self, session_id: &str) -> Result<Option<Session>> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;

        if session.status != SessionStatus::Recovering {
            return Ok(None);
        }

        session.status = SessionStatus::Pending;
        session.retries += 1;
        session.started_at = None;
        session.completed_at = None;
        self.checkpoint(session);

        tracing::info!(session = %session_id, retries = session.retries, "Session recovered");
        Ok(Some(session.clone()))
    }

    /// Sessions waiting to be recovered, oldest first
    pub fn recovering_sessions(&self) -> Vec<Session> {
        let mut list: Vec<Session> = self
            .lock()
            .values()
            .filter(|s| s.status == SessionStatus::Recovering)
            .cloned()
            .collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.lock().get(session_id).cloned()
    }

    /// Sessions currently Running
    pub fn active_sessions(&self) -> Vec<Session> {
        self.lock()
            .values()
            .filter(|s| s.status == SessionStatus::Running)
            .cloned()
            .collect()
    }

    pub fn all_sessions(&self) -> Vec<Session> {
        let mut list: Vec<Session> = self.lock().values().cloned().collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    /// Builds a snapshot of registry counters
    pub fn stats(&self) -> SessionStats {
        let sessions = self.lock();

        let mut by_status: BTreeMap<String, usize> = SessionStatus::all_states()
            .into_iter()
            .map(|s| (s.to_db_string().to_string(), 0))
            .collect();

        let mut stats = SessionStats {
            total_sessions: sessions.len(),
            ..Default::default()
        };

        for session in sessions.values() {
            *by_status
                .entry(session.status.to_db_string().to_string())
                .or_insert(0) += 1;
            stats.total_records += session.records_count;
            stats.total_pages += session.pages_count;
            stats.total_errors += session.errors.len();
            if session.status == SessionStatus::Running {
                stats.active_sessions += 1;
            }
        }

        stats.by_status = by_status;
        stats
    }
}

impl ProgressObserver for SessionRegistry {
    fn on_progress(&self, session_id: &str, records: usize, pages: usize) {
        let mut extra = BTreeMap::new();
        extra.insert("last_page".to_string(), PayloadValue::from(pages));

        if let Err(e) = self.update_progress(session_id, Some(records), Some(pages), extra) {
            tracing::debug!(session = %session_id, "Progress update ignored: {}", e);
        }
    }
}
