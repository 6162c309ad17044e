//! Crawler module for catalog harvesting
//!
//! This module contains the harvesting logic, including:
//! - The `PageFetcher` seam and its per-call context
//! - HTML parsing of catalog listing pages
//! - An HTTP fetcher that paginates a listing with randomized pacing
//! - The orchestrator driving a bounded worker pool

mod catalog;
mod fetcher;
mod orchestrator;
mod parser;

pub use catalog::HttpCatalogFetcher;
pub use fetcher::{
    build_http_client, FetchContext, FetchOutput, FetchStats, PageFetcher, PageStep,
    ProgressObserver,
};
pub use orchestrator::{run_crawl, Orchestrator};
pub use parser::{parse_listing, ListingItem, ParsedListing};
