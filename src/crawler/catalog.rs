//! HTTP catalog fetcher
//!
//! Walks the paginated listing for one target key: fetch a page, extract its
//! entries, follow the `next` link, pause, repeat. The walk stops at the
//! configured page limit or when the listing has no further page.

use super::fetcher::{build_http_client, FetchContext, FetchOutput, FetchStats, PageFetcher, PageStep};
use super::parser::{parse_listing, ListingItem};
use crate::aggregator::Record;
use crate::config::Config;
use crate::FetchError;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::Client;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use url::Url;

/// Fetches catalog listings over HTTP
pub struct HttpCatalogFetcher {
    client: Client,
    targets: HashMap<String, Url>,
    max_pages: u32,
    delay_min_ms: u64,
    delay_max_ms: u64,
}

impl HttpCatalogFetcher {
    /// Creates a fetcher for every target in the configuration
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration
    ///
    /// # Returns
    ///
    /// * `Ok(HttpCatalogFetcher)` - Ready to fetch
    /// * `Err(GleanerError)` - HTTP client could not be built or a URL is invalid
    pub fn new(config: &Config) -> crate::Result<Self> {
        let client = build_http_client(&config.scraping)?;

        let mut targets = HashMap::new();
        for target in &config.targets {
            let url = Url::parse(&target.url).map_err(|e| {
                crate::ConfigError::InvalidUrl(format!("{} ({}): {}", target.url, target.key, e))
            })?;
            targets.insert(target.key.clone(), url);
        }

        Ok(Self {
            client,
            targets,
            max_pages: config.scraping.max_pages_per_target,
            delay_min_ms: config.scraping.scrape_delay_min_ms,
            delay_max_ms: config.scraping.scrape_delay_max_ms,
        })
    }

    /// Fetches one page body, classifying failures
    async fn fetch_page(&self, url: &Url) -> Result<String, FetchError> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Http {
                    url: url.to_string(),
                    source: e,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|e| FetchError::Http {
            url: url.to_string(),
            source: e,
        })
    }

    /// Random pause between page loads
    fn page_delay(&self) -> Duration {
        let ms = if self.delay_max_ms > self.delay_min_ms {
            rand::thread_rng().gen_range(self.delay_min_ms..=self.delay_max_ms)
        } else {
            self.delay_min_ms
        };
        Duration::from_millis(ms)
    }

    fn to_record(item: ListingItem, ctx: &FetchContext, started: Instant) -> Record {
        let mut record = Record::new(&item.title, &ctx.target_key);
        record.price = item.price;
        record.availability = item.availability;
        record.rating = item.rating;
        record.url = item.url;
        record.image_url = item.image_url;
        record.extracted_at = Utc::now();
        record.session_id = ctx.session_id.clone();
        record.worker_id = ctx.worker_id.clone();
        record.extraction_duration = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
        record.retry_count = ctx.retry_count();
        record
    }
}

#[async_trait]
impl PageFetcher for HttpCatalogFetcher {
    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutput, FetchError> {
        let start_url = self
            .targets
            .get(&ctx.target_key)
            .cloned()
            .ok_or_else(|| FetchError::UnknownTarget(ctx.target_key.clone()))?;

        let started = Instant::now();
        let mut records = Vec::new();
        let mut pages = 0usize;
        let mut current = start_url;

        loop {
            let body = match self.fetch_page(&current).await {
                Ok(body) => body,
                // Nothing harvested yet: let the retry policy decide
                Err(e) if pages == 0 => return Err(e),
                Err(e) => {
                    tracing::warn!("Stopping pagination at {}: {}", current, e);
                    break;
                }
            };

            let listing = parse_listing(&body, &current).map_err(|message| FetchError::Parse {
                url: current.to_string(),
                message,
            })?;

            pages += 1;
            let found = listing.items.len();
            records.extend(
                listing
                    .items
                    .into_iter()
                    .map(|item| Self::to_record(item, ctx, started)),
            );
            tracing::debug!("Page {} of {}: {} entries", pages, ctx.target_key, found);
            ctx.report_progress(records.len(), pages);

            if pages >= self.max_pages as usize {
                break;
            }

            match listing.next {
                PageStep::HasMore(next) => {
                    tokio::time::sleep(self.page_delay()).await;
                    current = next;
                }
                PageStep::NoMore => break,
            }
        }

        tracing::info!(
            "Harvested {} records from {} pages of {}",
            records.len(),
            pages,
            ctx.target_key
        );

        let stats = FetchStats {
            records_scraped: records.len(),
            pages_scraped: pages,
            duration_secs: started.elapsed().as_secs_f64(),
            retry_count: ctx.retry_count(),
        };
        Ok(FetchOutput { records, stats })
    }
}
