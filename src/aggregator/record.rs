//! Extracted catalog records and the fixed sink column schema

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One catalog entry produced by a fetcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub title: String,
    pub price: String,
    pub availability: String,
    /// Star rating 1..=5, when the listing shows one
    pub rating: Option<u8>,
    pub target_key: String,
    pub url: String,
    pub image_url: String,
    pub description: Option<String>,
    /// Catalog identifier such as a UPC
    pub external_id: Option<String>,
    pub extracted_at: DateTime<Utc>,
    pub session_id: String,
    pub worker_id: String,
    /// Seconds spent extracting the page the record came from
    pub extraction_duration: f64,
    pub retry_count: u32,
    /// Stamped by the aggregator when the record is accepted
    pub processed_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Creates a record with only the identifying fields filled in
    pub fn new(title: &str, target_key: &str) -> Self {
        Self {
            title: title.to_string(),
            price: String::new(),
            availability: String::new(),
            rating: None,
            target_key: target_key.to_string(),
            url: String::new(),
            image_url: String::new(),
            description: None,
            external_id: None,
            extracted_at: Utc::now(),
            session_id: String::new(),
            worker_id: String::new(),
            extraction_duration: 0.0,
            retry_count: 0,
            processed_at: None,
        }
    }

    /// Deduplication key: the same title under the same target is one record
    pub fn dedup_key(&self) -> (String, String) {
        (self.title.clone(), self.target_key.clone())
    }

    /// Renders one column as sink text; absent values become empty strings
    pub fn column_value(&self, column: Column) -> String {
        match column {
            Column::Title => self.title.clone(),
            Column::Price => self.price.clone(),
            Column::Availability => self.availability.clone(),
            Column::Rating => self.rating.map(|r| r.to_string()).unwrap_or_default(),
            Column::TargetKey => self.target_key.clone(),
            Column::Url => self.url.clone(),
            Column::ImageUrl => self.image_url.clone(),
            Column::Description => self.description.clone().unwrap_or_default(),
            Column::ExternalId => self.external_id.clone().unwrap_or_default(),
            Column::ExtractedAt => self
                .extracted_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            Column::SessionId => self.session_id.clone(),
            Column::WorkerId => self.worker_id.clone(),
            Column::ExtractionDuration => format!("{:.3}", self.extraction_duration),
            Column::RetryCount => self.retry_count.to_string(),
        }
    }
}

/// Columns of the sink schema, in sink order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Title,
    Price,
    Availability,
    Rating,
    TargetKey,
    Url,
    ImageUrl,
    Description,
    ExternalId,
    ExtractedAt,
    SessionId,
    WorkerId,
    ExtractionDuration,
    RetryCount,
}

impl Column {
    pub const ALL: [Column; 14] = [
        Self::Title,
        Self::Price,
        Self::Availability,
        Self::Rating,
        Self::TargetKey,
        Self::Url,
        Self::ImageUrl,
        Self::Description,
        Self::ExternalId,
        Self::ExtractedAt,
        Self::SessionId,
        Self::WorkerId,
        Self::ExtractionDuration,
        Self::RetryCount,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Price => "price",
            Self::Availability => "availability",
            Self::Rating => "rating",
            Self::TargetKey => "target_key",
            Self::Url => "url",
            Self::ImageUrl => "image_url",
            Self::Description => "description",
            Self::ExternalId => "external_id",
            Self::ExtractedAt => "extracted_at",
            Self::SessionId => "session_id",
            Self::WorkerId => "worker_id",
            Self::ExtractionDuration => "extraction_duration",
            Self::RetryCount => "retry_count",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Renders a record as one full sink row
///
/// Columns outside `configured` are written empty so every row keeps the
/// fixed schema width.
pub fn render_row(record: &Record, configured: &[Column]) -> Vec<String> {
    Column::ALL
        .iter()
        .map(|column| {
            if configured.contains(column) {
                record.column_value(*column)
            } else {
                String::new()
            }
        })
        .collect()
}
