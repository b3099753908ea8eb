use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::lifecycle::SourceStatus;
use crate::recipe::Recipe;

/// One event record produced by replaying a recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEvent {
    pub title: String,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: Option<DateTime<FixedOffset>>,
    pub description: Option<String>,
    pub location_name: Option<String>,
    pub location_address: Option<String>,
    /// Link to the event's own page, absolute.
    pub url: Option<String>,
    /// Page the record was found on.
    pub page_url: String,
    pub is_free: bool,
    pub price_min: Option<f64>,
    pub image_url: Option<String>,
    /// Stable key derived from title + start time.
    pub dedup_key: String,
}

impl ExtractedEvent {
    pub fn new(
        title: impl Into<String>,
        start_time: DateTime<FixedOffset>,
        page_url: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let dedup_key = dedup_key(&title, &start_time);
        Self {
            title,
            start_time,
            end_time: None,
            description: None,
            location_name: None,
            location_address: None,
            url: None,
            page_url: page_url.into(),
            is_free: false,
            price_min: None,
            image_url: None,
            dedup_key,
        }
    }

    /// Link used downstream: the event's own page, else the listing page.
    pub fn source_url(&self) -> &str {
        self.url.as_deref().unwrap_or(&self.page_url)
    }
}

/// Deterministic dedup key: first 16 hex chars of SHA-256 over the
/// normalised title and the start instant in UTC.
pub fn dedup_key(title: &str, start_time: &DateTime<FixedOffset>) -> String {
    let slug = format!(
        "{}:{}",
        title.trim().to_lowercase(),
        start_time.with_timezone(&Utc).to_rfc3339()
    );
    compute_hash(&slug)[..16].to_string()
}

/// A user-registered URL under management.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub domain: String,
    pub recipe: Option<Recipe>,
    pub status: SourceStatus,
    /// Sub-state restored when a disabled source is re-enabled.
    pub resume_status: Option<SourceStatus>,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub last_event_count: u32,
    pub last_error: Option<String>,
    /// Consecutive automatic re-analyses without a productive replay.
    pub reanalysis_attempts: u32,
    pub next_analysis_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn is_enabled(&self) -> bool {
        self.status != SourceStatus::Disabled
    }

    /// Lifecycle-owned columns, as written back by `update_source_outcome`.
    pub fn outcome_update(&self) -> SourceUpdate {
        SourceUpdate {
            status: self.status,
            resume_status: self.resume_status,
            last_event_count: self.last_event_count,
            last_scraped_at: self.last_scraped_at,
            last_error: self.last_error.clone(),
            reanalysis_attempts: self.reanalysis_attempts,
            next_analysis_at: self.next_analysis_at,
        }
    }
}

/// DTO for registering a new source.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub url: String,
    pub domain: String,
}

impl NewSource {
    pub fn new(url: impl Into<String>, domain: impl Into<String>) -> Self {
        let domain = domain.into();
        Self {
            name: domain.clone(),
            url: url.into(),
            domain,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Lifecycle columns written after a replay or analysis outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceUpdate {
    pub status: SourceStatus,
    pub resume_status: Option<SourceStatus>,
    pub last_event_count: u32,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reanalysis_attempts: u32,
    pub next_analysis_at: Option<DateTime<Utc>>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
