//! Shared fixtures: a scripted fetcher and small-interval configs

use async_trait::async_trait;
use gleaner::aggregator::Record;
use gleaner::config::{CheckpointConfig, Config, DataConfig, MonitorConfig, ScrapingConfig, TargetEntry};
use gleaner::crawler::{FetchContext, FetchOutput, FetchStats, PageFetcher};
use gleaner::FetchError;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What one scripted fetch call does
#[derive(Clone)]
pub enum Step {
    Succeed(Vec<String>),
    Fail(String),
    /// Sleeps before returning the titles
    Slow(Duration, Vec<String>),
    /// Panics inside the fetch
    Panic(String),
}

/// Fetcher that replays a script per target key
///
/// Once a key's script is exhausted, further calls succeed with its
/// default titles.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    defaults: Mutex<HashMap<String, Vec<String>>>,
    calls: Mutex<Vec<(String, u32)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Delay applied to every call
    pub latency: Duration,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn titles(self, key: &str, titles: &[&str]) -> Self {
        self.defaults
            .lock()
            .unwrap()
            .insert(key.to_string(), titles.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn script(self, key: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(key.to_string(), steps.into());
        self
    }

    /// (target key, attempt) for every call, in call order
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, key: &str) -> Step {
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|steps| steps.pop_front());
        scripted.unwrap_or_else(|| {
            Step::Succeed(
                self.defaults
                    .lock()
                    .unwrap()
                    .get(key)
                    .cloned()
                    .unwrap_or_default(),
            )
        })
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutput, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.target_key.clone(), ctx.attempt));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let step = self.next_step(&ctx.target_key);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = match step {
            Step::Panic(message) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                panic!("{}", message);
            }
            Step::Fail(message) => Err(FetchError::Other(message)),
            Step::Succeed(titles) => Ok(output(ctx, titles)),
            Step::Slow(delay, titles) => {
                tokio::time::sleep(delay).await;
                Ok(output(ctx, titles))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn output(ctx: &FetchContext, titles: Vec<String>) -> FetchOutput {
    let records: Vec<Record> = titles
        .iter()
        .map(|title| {
            let mut record = Record::new(title, &ctx.target_key);
            record.price = "£12.50".to_string();
            record.session_id = ctx.session_id.clone();
            record.worker_id = ctx.worker_id.clone();
            record.retry_count = ctx.retry_count();
            record
        })
        .collect();

    ctx.report_progress(records.len(), 1);

    FetchOutput {
        stats: FetchStats {
            records_scraped: records.len(),
            pages_scraped: 1,
            duration_secs: 0.01,
            retry_count: ctx.retry_count(),
        },
        records,
    }
}

/// Config with tiny delays and every path inside `dir`
pub fn test_config(dir: &Path, keys: &[&str]) -> Config {
    Config {
        scraping: ScrapingConfig {
            max_concurrent_sessions: 2,
            max_retries: 3,
            retry_delay_ms: 0,
            scrape_delay_min_ms: 0,
            scrape_delay_max_ms: 0,
            ..ScrapingConfig::default()
        },
        data: DataConfig {
            output_path: dir.join("records.db").to_string_lossy().to_string(),
            report_path: dir.join("report.json").to_string_lossy().to_string(),
            buffer_size: 50,
            write_interval_ms: 50,
            columns: None,
        },
        checkpoint: CheckpointConfig {
            database_path: dir.join("sessions.db").to_string_lossy().to_string(),
        },
        monitor: MonitorConfig {
            interval_ms: 100,
            admission_backoff_ms: 10,
            dequeue_timeout_ms: 20,
        },
        targets: keys
            .iter()
            .map(|key| TargetEntry {
                key: key.to_string(),
                url: format!("https://books.example.com/{}/index.html", key.to_lowercase()),
            })
            .collect(),
    }
}

pub fn strings(titles: &[&str]) -> Vec<String> {
    titles.iter().map(|t| t.to_string()).collect()
}
