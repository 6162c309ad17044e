//! Page fetcher interface
//!
//! This module defines the seam between the orchestrator and whatever
//! actually drives a catalog:
//! - `PageFetcher`, the async capability that harvests one target key
//! - `FetchContext`, the explicit per-call context (session, worker, progress)
//! - `FetchOutput` / `FetchStats`, what a successful harvest returns
//! - `build_http_client` for fetchers that talk HTTP

use crate::aggregator::Record;
use crate::config::ScrapingConfig;
use crate::FetchError;
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Summary of one harvest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchStats {
    pub records_scraped: usize,
    pub pages_scraped: usize,
    pub duration_secs: f64,
    /// Attempts that preceded this one
    pub retry_count: u32,
}

/// Records and stats returned by a successful harvest
#[derive(Debug, Clone, Default)]
pub struct FetchOutput {
    pub records: Vec<Record>,
    pub stats: FetchStats,
}

/// Outcome of reading one listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStep {
    /// The listing links to a further page
    HasMore(Url),
    /// Last page of the listing
    NoMore,
}

/// Receives per-page progress from a running fetch
pub trait ProgressObserver: Send + Sync {
    /// Called with running totals after each page
    fn on_progress(&self, session_id: &str, records: usize, pages: usize);
}

/// Everything a fetcher needs to know about the call it is serving
#[derive(Clone)]
pub struct FetchContext {
    pub session_id: String,
    pub worker_id: String,
    pub target_key: String,
    /// 1-based attempt number of the owning task
    pub attempt: u32,
    progress: Option<Arc<dyn ProgressObserver>>,
}

impl FetchContext {
    pub fn new(session_id: &str, worker_id: &str, target_key: &str, attempt: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            worker_id: worker_id.to_string(),
            target_key: target_key.to_string(),
            attempt,
            progress: None,
        }
    }

    /// Attaches a progress observer
    pub fn with_progress(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.progress = Some(observer);
        self
    }

    /// Forwards running totals to the observer, if any
    pub fn report_progress(&self, records: usize, pages: usize) {
        if let Some(observer) = &self.progress {
            observer.on_progress(&self.session_id, records, pages);
        }
    }

    /// Number of attempts before this one
    pub fn retry_count(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }

    /// Tracing span carrying the session and worker ids
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "session",
            id = %self.session_id,
            worker = %self.worker_id,
            target = %self.target_key
        )
    }
}

impl fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContext")
            .field("session_id", &self.session_id)
            .field("worker_id", &self.worker_id)
            .field("target_key", &self.target_key)
            .field("attempt", &self.attempt)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Harvests every record for one target key
///
/// Implementations paginate up to their page limit, pause between pages,
/// and report progress through the context after each page. Any error fails
/// the attempt; the orchestrator decides whether to retry.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutput, FetchError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - Scraping settings supplying the user agent and timeout
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &ScrapingConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(config.request_timeout())
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}
