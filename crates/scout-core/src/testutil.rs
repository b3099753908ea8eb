//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::lifecycle::SourceStatus;
use crate::models::{ExtractedEvent, NewSource, Source, SourceUpdate};
use crate::recipe::{CssFields, CssStrategy, FieldFormat, FieldRule, Pagination, Recipe};
use crate::router::extract_domain;
use crate::traits::{Cleaner, Fetcher, RecipeGenerator, SourceStore};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// CSS recipe matching [`listing_page`] markup.
pub fn make_test_recipe(confidence: f64) -> Recipe {
    Recipe::css(test_css_strategy(None, 3), confidence, "test recipe").unwrap()
}

pub fn test_css_strategy(next_selector: Option<&str>, max_pages: u32) -> CssStrategy {
    let mut fields = CssFields::new(
        FieldRule::text("h3.title"),
        FieldRule::attr("time", "datetime").with_format(FieldFormat::Iso),
    );
    fields.url = Some(FieldRule::attr("a.more", "href"));
    fields.price = Some(FieldRule::text(".price"));
    CssStrategy {
        event_container: "div.event".into(),
        fields,
        pagination: Pagination {
            next_selector: next_selector.map(str::to_string),
            max_pages,
        },
    }
}

/// A freshly registered source: `pending`, no recipe.
pub fn make_test_source(url: &str) -> Source {
    let domain = extract_domain(url).unwrap_or_else(|_| "example.org".into());
    let now = Utc::now();
    Source {
        id: Uuid::new_v4(),
        name: domain.clone(),
        url: url.to_string(),
        domain,
        recipe: None,
        status: SourceStatus::Pending,
        resume_status: None,
        last_scraped_at: None,
        last_event_count: 0,
        last_error: None,
        reanalysis_attempts: 0,
        next_analysis_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// One `div.event` card.
pub fn event_card(title: &str, start: &str, price: &str) -> String {
    let slug = title.to_lowercase().replace(' ', "-");
    format!(
        r#"<div class="event">
            <h3 class="title">{title}</h3>
            <time datetime="{start}">{start}</time>
            <span class="price">{price}</span>
            <a class="more" href="/events/{slug}">Details</a>
        </div>"#
    )
}

/// A listing page with the given cards and an optional "next" link.
pub fn listing_page(cards: &[String], next_href: Option<&str>) -> String {
    let next = next_href
        .map(|href| format!(r#"<a class="next" href="{href}">Next</a>"#))
        .unwrap_or_default();
    format!(
        "<html><head><title>Events</title></head><body><main>{}{next}</main></body></html>",
        cards.join("\n")
    )
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher serving pages by URL.
///
/// Queued responses are returned first, then per-URL pages, then the
/// default body; anything else is an HTTP 404.
#[derive(Clone)]
pub struct MockFetcher {
    responses: Arc<Mutex<Vec<Result<String, AppError>>>>,
    pages: Arc<Mutex<HashMap<String, String>>>,
    default: Arc<Mutex<Option<String>>>,
    /// Every URL fetched, in order.
    pub fetched: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    fn empty() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            pages: Arc::new(Mutex::new(HashMap::new())),
            default: Arc::new(Mutex::new(None)),
            fetched: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Serves `html` for every URL.
    pub fn new(html: &str) -> Self {
        let fetcher = Self::empty();
        *fetcher.default.lock().unwrap() = Some(html.to_string());
        fetcher
    }

    pub fn with_pages(pages: &[(&str, String)]) -> Self {
        let fetcher = Self::empty();
        fetcher.pages.lock().unwrap().extend(
            pages
                .iter()
                .map(|(url, html)| (url.to_string(), html.clone())),
        );
        fetcher
    }

    pub fn with_error(error: AppError) -> Self {
        let fetcher = Self::empty();
        fetcher.responses.lock().unwrap().push(Err(error));
        fetcher
    }

    /// Replace (or add) the page served for `url`.
    pub fn set_page(&self, url: &str, html: String) {
        self.pages.lock().unwrap().insert(url.to_string(), html);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched.lock().unwrap().len()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.fetched.lock().unwrap().push(url.to_string());

        let mut responses = self.responses.lock().unwrap();
        if !responses.is_empty() {
            return responses.remove(0);
        }
        if let Some(page) = self.pages.lock().unwrap().get(url) {
            return Ok(page.clone());
        }
        match self.default.lock().unwrap().as_ref() {
            Some(html) => Ok(html.clone()),
            None => Err(AppError::HttpError(format!("HTTP 404 Not Found for {url}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// MockCleaner
// ---------------------------------------------------------------------------

/// Mock cleaner that applies a simple transformation.
#[derive(Clone)]
pub struct MockCleaner {
    error: Arc<Mutex<Option<AppError>>>,
}

impl MockCleaner {
    /// Creates a cleaner that returns the input unchanged.
    pub fn passthrough() -> Self {
        Self {
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates a cleaner that returns an error.
    pub fn with_error(error: AppError) -> Self {
        Self {
            error: Arc::new(Mutex::new(Some(error))),
        }
    }
}

impl Cleaner for MockCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        let mut err = self.error.lock().unwrap();
        if let Some(e) = err.take() {
            return Err(e);
        }
        Ok(html.to_string())
    }
}

// ---------------------------------------------------------------------------
// MockGenerator
// ---------------------------------------------------------------------------

/// Mock recipe generator returning queued replies, then a sticky fallback.
#[derive(Clone)]
pub struct MockGenerator {
    responses: Arc<Mutex<Vec<Result<serde_json::Value, AppError>>>>,
    fallback: Arc<Mutex<Option<serde_json::Value>>>,
    /// `(url, cleaned_html)` of every call.
    pub calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockGenerator {
    /// Returns `reply` on every call.
    pub fn new(reply: serde_json::Value) -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            fallback: Arc::new(Mutex::new(Some(reply))),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<serde_json::Value, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            fallback: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl RecipeGenerator for MockGenerator {
    async fn generate(
        &self,
        url: &str,
        cleaned_html: &str,
    ) -> Result<serde_json::Value, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), cleaned_html.to_string()));

        let mut responses = self.responses.lock().unwrap();
        if !responses.is_empty() {
            return responses.remove(0);
        }
        self.fallback
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AppError::LlmError {
                message: "no reply configured".into(),
                status_code: 500,
                retryable: true,
            })
    }
}

/// LLM reply describing [`test_css_strategy`].
pub fn candidate_reply(confidence: f64, next_selector: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "strategy": "css",
        "confidence": confidence,
        "notes": "cards in main",
        "css": {
            "event_container": "div.event",
            "fields": {
                "title": {"selector": "h3.title", "attr": null},
                "start_time": {"selector": "time", "attr": "datetime", "format": "iso"},
                "url": {"selector": "a.more", "attr": "href"},
                "price": {"selector": ".price"},
                "description": null
            },
            "pagination": {"next_selector": next_selector, "max_pages": 3}
        }
    })
}

// ---------------------------------------------------------------------------
// MockSourceStore
// ---------------------------------------------------------------------------

/// In-memory source store.
#[derive(Clone, Default)]
pub struct MockSourceStore {
    pub sources: Arc<Mutex<Vec<Source>>>,
    /// Events keyed by `(source_id, dedup_key)`.
    pub events: Arc<Mutex<HashMap<(Uuid, String), ExtractedEvent>>>,
    pub outcome_updates: Arc<Mutex<Vec<(Uuid, SourceUpdate)>>>,
    update_error: Arc<Mutex<Option<AppError>>>,
}

impl MockSourceStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: Vec<Source>) -> Self {
        let store = Self::default();
        *store.sources.lock().unwrap() = sources;
        store
    }

    pub fn with_update_error(error: AppError) -> Self {
        let store = Self::default();
        *store.update_error.lock().unwrap() = Some(error);
        store
    }

    pub fn source(&self, id: Uuid) -> Source {
        self.sources
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .unwrap()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn with_source<T>(&self, id: Uuid, f: impl FnOnce(&mut Source) -> T) -> Result<T, AppError> {
        let mut sources = self.sources.lock().unwrap();
        let source = sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::DatabaseError(format!("source {id} not found")))?;
        Ok(f(source))
    }
}

impl SourceStore for MockSourceStore {
    async fn create_source(&self, new: &NewSource) -> Result<Source, AppError> {
        let mut sources = self.sources.lock().unwrap();
        if sources.iter().any(|s| s.url == new.url) {
            return Err(AppError::DatabaseError(format!(
                "duplicate source url {}",
                new.url
            )));
        }
        let mut source = make_test_source(&new.url);
        source.name = new.name.clone();
        source.domain = new.domain.clone();
        sources.push(source.clone());
        Ok(source)
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>, AppError> {
        Ok(self.sources.lock().unwrap().iter().find(|s| s.id == id).cloned())
    }

    async fn get_source_by_url(&self, url: &str) -> Result<Option<Source>, AppError> {
        Ok(self
            .sources
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.url == url)
            .cloned())
    }

    async fn list_enabled_sources(&self) -> Result<Vec<Source>, AppError> {
        Ok(self
            .sources
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !matches!(s.status, SourceStatus::Failed | SourceStatus::Disabled))
            .cloned()
            .collect())
    }

    async fn list_sources(&self) -> Result<Vec<Source>, AppError> {
        Ok(self.sources.lock().unwrap().clone())
    }

    async fn save_recipe(
        &self,
        id: Uuid,
        recipe: &Recipe,
        status: SourceStatus,
    ) -> Result<(), AppError> {
        self.with_source(id, |s| {
            s.recipe = Some(recipe.clone());
            s.status = status;
            s.updated_at = Utc::now();
        })
    }

    async fn update_source_outcome(&self, id: Uuid, update: &SourceUpdate) -> Result<(), AppError> {
        if let Some(e) = self.update_error.lock().unwrap().take() {
            return Err(e);
        }
        self.outcome_updates.lock().unwrap().push((id, update.clone()));
        self.with_source(id, |s| {
            s.status = update.status;
            s.resume_status = update.resume_status;
            s.last_event_count = update.last_event_count;
            s.last_scraped_at = update.last_scraped_at;
            s.last_error = update.last_error.clone();
            s.reanalysis_attempts = update.reanalysis_attempts;
            s.next_analysis_at = update.next_analysis_at;
            s.updated_at = Utc::now();
        })
    }

    async fn upsert_event(&self, source_id: Uuid, event: &ExtractedEvent) -> Result<bool, AppError> {
        let previous = self
            .events
            .lock()
            .unwrap()
            .insert((source_id, event.dedup_key.clone()), event.clone());
        Ok(previous.is_none())
    }
}
