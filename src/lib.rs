//! Gleaner: a concurrent catalog harvest orchestrator
//!
//! This crate runs a bounded pool of scraping sessions over a paginated catalog,
//! retrying failed work, checkpointing session progress for crash recovery,
//! and funnelling deduplicated records into an append-only sink.

pub mod aggregator;
pub mod config;
pub mod crawler;
pub mod output;
pub mod sessions;
pub mod state;
pub mod storage;
pub mod tasks;

use thiserror::Error;

/// Main error type for Gleaner operations
#[derive(Debug, Error)]
pub enum GleanerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown {kind}: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid {kind} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Session admission denied: {running} of {limit} sessions running")]
    AdmissionDenied { running: usize, limit: usize },

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Errors raised by a page fetcher while harvesting one target
///
/// Every variant is recoverable from the orchestrator's point of view: the
/// owning task goes back through the retry policy.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error for {url}: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("Request timeout for {url}")]
    Timeout { url: String },

    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Failed to parse {url}: {message}")]
    Parse { url: String, message: String },

    #[error("No catalog URL configured for target '{0}'")]
    UnknownTarget(String),

    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Short machine-readable label, stored in session error logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Timeout { .. } => "timeout",
            Self::Status { .. } => "status",
            Self::Parse { .. } => "parse",
            Self::UnknownTarget(_) => "unknown_target",
            Self::Other(_) => "fetch",
        }
    }
}

impl GleanerError {
    /// Short machine-readable label, stored in session error logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::AdmissionDenied { .. } => "admission_denied",
            Self::Fetch(e) => e.kind(),
            Self::Panicked(_) => "panic",
            Self::Storage(_) | Self::Database(_) => "storage",
            Self::Reqwest(_) => "http",
            Self::Json(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

/// Result type alias for Gleaner operations
pub type Result<T> = std::result::Result<T, GleanerError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use aggregator::{DataAggregator, Record};
pub use config::Config;
pub use crawler::{FetchContext, Orchestrator, PageFetcher};
pub use sessions::{Session, SessionRegistry};
pub use state::{SessionStatus, TaskPriority, TaskStatus};
pub use tasks::{Task, TaskQueue};
