use std::future::Future;

use uuid::Uuid;

use crate::error::AppError;
use crate::lifecycle::SourceStatus;
use crate::models::{ExtractedEvent, NewSource, Source, SourceUpdate};
use crate::recipe::Recipe;

/// Fetches raw HTML content from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Reduces raw HTML to the markup worth showing an LLM.
pub trait Cleaner: Send + Sync + Clone {
    fn clean(&self, html: &str) -> Result<String, AppError>;
}

/// Produces a recipe candidate from a page using an LLM.
pub trait RecipeGenerator: Send + Sync + Clone {
    /// Sends the page URL and cleaned HTML, returns the raw JSON reply.
    ///
    /// Errors are surfaced as-is; implementations must not retry.
    fn generate(
        &self,
        url: &str,
        cleaned_html: &str,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

/// Persists sources, their recipes and extracted events.
pub trait SourceStore: Send + Sync + Clone {
    /// Register a new source in `pending`. Fails if the URL already exists.
    fn create_source(
        &self,
        source: &NewSource,
    ) -> impl Future<Output = Result<Source, AppError>> + Send;

    fn get_source(&self, id: Uuid) -> impl Future<Output = Result<Option<Source>, AppError>> + Send;

    fn get_source_by_url(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Option<Source>, AppError>> + Send;

    /// Every source the scheduler may act on (anything but `failed`/`disabled`).
    fn list_enabled_sources(&self) -> impl Future<Output = Result<Vec<Source>, AppError>> + Send;

    /// Every source, oldest first.
    fn list_sources(&self) -> impl Future<Output = Result<Vec<Source>, AppError>> + Send;

    /// Replace the recipe and status in one write.
    fn save_recipe(
        &self,
        id: Uuid,
        recipe: &Recipe,
        status: SourceStatus,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Write the lifecycle-owned columns after an outcome.
    fn update_source_outcome(
        &self,
        id: Uuid,
        update: &SourceUpdate,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Insert or refresh an event, keyed on `(source_id, dedup_key)`.
    ///
    /// Returns true when a new row was inserted.
    fn upsert_event(
        &self,
        source_id: Uuid,
        event: &ExtractedEvent,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;
}
