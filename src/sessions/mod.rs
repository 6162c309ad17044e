//! Session module
//!
//! A session is one attempt at harvesting one target key. The registry in
//! this module enforces the concurrency ceiling, checkpoints every state
//! change, and brings back sessions left unfinished by a crashed run.

mod registry;

pub use registry::SessionRegistry;

use crate::state::SessionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Primitive value stored in a session's checkpoint payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for PayloadValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PayloadValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for PayloadValue {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for PayloadValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for PayloadValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// One entry in a session's error log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

/// Lifecycle record of one harvest attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub target_key: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub records_count: usize,
    #[serde(default)]
    pub pages_count: usize,
    #[serde(default)]
    pub errors: Vec<SessionError>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checkpoint_payload: BTreeMap<String, PayloadValue>,
}

impl Session {
    /// Creates a Pending session with an id derived from the target key
    pub fn new(target_key: &str) -> Self {
        Self {
            id: new_session_id(target_key),
            target_key: target_key.to_string(),
            status: SessionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            records_count: 0,
            pages_count: 0,
            errors: Vec::new(),
            retries: 0,
            last_checkpoint_at: None,
            checkpoint_payload: BTreeMap::new(),
        }
    }

    /// Seconds since the session started, if it has
    pub fn runtime_secs(&self, now: DateTime<Utc>) -> Option<f64> {
        self.started_at
            .map(|start| (now - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// `<slug>-<8 hex>`, e.g. `science-fiction-1a2b3c4d`
fn new_session_id(target_key: &str) -> String {
    let slug: String = target_key
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}-{}", slug, &hex[..8])
}

/// Snapshot of registry counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub by_status: BTreeMap<String, usize>,
    pub active_sessions: usize,
    pub total_records: usize,
    pub total_pages: usize,
    pub total_errors: usize,
}
