use crate::aggregator::Column;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Gleaner
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub scraping: ScrapingConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetEntry>,
}

impl Config {
    /// Keys of every configured target, in file order
    pub fn target_keys(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.key.clone()).collect()
    }
}

/// Session and fetch behavior
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapingConfig {
    /// Ceiling on simultaneously running sessions, also the worker pool size
    #[serde(rename = "max-concurrent-sessions", default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,

    /// Maximum attempts per task before it is marked failed
    #[serde(rename = "max-retries", default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause a worker takes after a failed attempt (milliseconds)
    #[serde(rename = "retry-delay-ms", default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Lower bound of the randomized delay between pages (milliseconds)
    #[serde(rename = "scrape-delay-min-ms", default = "default_delay_min_ms")]
    pub scrape_delay_min_ms: u64,

    /// Upper bound of the randomized delay between pages (milliseconds)
    #[serde(rename = "scrape-delay-max-ms", default = "default_delay_max_ms")]
    pub scrape_delay_max_ms: u64,

    /// Pages fetched per target before pagination stops
    #[serde(rename = "max-pages-per-target", default = "default_max_pages")]
    pub max_pages_per_target: u32,

    /// Running sessions older than this are reaped by the monitor (seconds)
    #[serde(rename = "session-timeout-secs", default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Per-request HTTP timeout (seconds)
    #[serde(rename = "request-timeout-secs", default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,
}

impl ScrapingConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_sessions(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            scrape_delay_min_ms: default_delay_min_ms(),
            scrape_delay_max_ms: default_delay_max_ms(),
            max_pages_per_target: default_max_pages(),
            session_timeout_secs: default_session_timeout(),
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Record sink and final report configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Path to the SQLite database records are appended to
    #[serde(rename = "output-path")]
    pub output_path: String,

    /// Path the final JSON report is written to
    #[serde(rename = "report-path", default = "default_report_path")]
    pub report_path: String,

    /// Buffered record count that triggers a flush
    #[serde(rename = "buffer-size", default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum time between flushes of a non-empty buffer (milliseconds)
    #[serde(rename = "write-interval-ms", default = "default_write_interval_ms")]
    pub write_interval_ms: u64,

    /// Columns to populate; the rest of the fixed schema is written empty
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

impl DataConfig {
    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    /// Resolves the configured column names, falling back to the full schema
    ///
    /// Unknown names are skipped here; validation rejects them at load time.
    pub fn columns(&self) -> Vec<Column> {
        match &self.columns {
            Some(names) => names.iter().filter_map(|n| Column::from_name(n)).collect(),
            None => Column::ALL.to_vec(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            output_path: "./output/records.db".to_string(),
            report_path: default_report_path(),
            buffer_size: default_buffer_size(),
            write_interval_ms: default_write_interval_ms(),
            columns: None,
        }
    }
}

/// Session checkpoint storage
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    /// Path to the SQLite database holding session checkpoints
    #[serde(rename = "database-path", default = "default_checkpoint_path")]
    pub database_path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            database_path: default_checkpoint_path(),
        }
    }
}

/// Worker pacing and monitor cadence
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// How often progress is logged and stale sessions are reaped (milliseconds)
    #[serde(rename = "interval-ms", default = "default_monitor_interval_ms")]
    pub interval_ms: u64,

    /// Sleep before re-checking a full admission gate (milliseconds)
    #[serde(rename = "admission-backoff-ms", default = "default_backoff_ms")]
    pub admission_backoff_ms: u64,

    /// Bounded wait for a task to become available (milliseconds)
    #[serde(rename = "dequeue-timeout-ms", default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn admission_backoff(&self) -> Duration {
        Duration::from_millis(self.admission_backoff_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
            admission_backoff_ms: default_backoff_ms(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
        }
    }
}

/// One catalog section to harvest
#[derive(Debug, Clone, Deserialize)]
pub struct TargetEntry {
    /// Target key, e.g. a genre name
    pub key: String,

    /// First listing page for this target
    pub url: String,
}

fn default_max_sessions() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_delay_min_ms() -> u64 {
    1_000
}

fn default_delay_max_ms() -> u64 {
    3_000
}

fn default_max_pages() -> u32 {
    5
}

fn default_session_timeout() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("gleaner/{}", env!("CARGO_PKG_VERSION"))
}

fn default_report_path() -> String {
    "./output/report.json".to_string()
}

fn default_buffer_size() -> usize {
    50
}

fn default_write_interval_ms() -> u64 {
    30_000
}

fn default_checkpoint_path() -> String {
    "./checkpoints/sessions.db".to_string()
}

fn default_monitor_interval_ms() -> u64 {
    10_000
}

fn default_backoff_ms() -> u64 {
    1_000
}

fn default_dequeue_timeout_ms() -> u64 {
    1_000
}
