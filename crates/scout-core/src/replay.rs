//! Replay engine: executes a stored recipe against live pages.
//!
//! No LLM involvement. Parsed documents never live across an `.await`;
//! each page is fetched, then extracted synchronously.

use std::collections::HashSet;

use scraper::Html;
use url::Url;

use crate::error::AppError;
use crate::extract::{CompiledRule, parse_datetime, parse_price, parse_selector, resolve_url};
use crate::models::ExtractedEvent;
use crate::recipe::{CssStrategy, FieldRule, Recipe, Strategy};
use crate::structured_data;
use crate::traits::Fetcher;

/// Events found on one page plus the resolved "next" link, if any.
#[derive(Debug)]
struct PageExtraction {
    events: Vec<ExtractedEvent>,
    containers: usize,
    next_url: Option<String>,
}

/// Compiled optional rules for one CSS strategy.
struct CompiledFields<'r> {
    title: CompiledRule<'r>,
    start_time: CompiledRule<'r>,
    end_time: Option<CompiledRule<'r>>,
    description: Option<CompiledRule<'r>>,
    location: Option<CompiledRule<'r>>,
    url: Option<CompiledRule<'r>>,
    price: Option<CompiledRule<'r>>,
    image: Option<CompiledRule<'r>>,
}

fn compile_opt(rule: Option<&FieldRule>) -> Result<Option<CompiledRule<'_>>, AppError> {
    rule.map(CompiledRule::compile).transpose()
}

impl<'r> CompiledFields<'r> {
    fn compile(css: &'r CssStrategy) -> Result<Self, AppError> {
        let f = &css.fields;
        Ok(Self {
            title: CompiledRule::compile(&f.title)?,
            start_time: CompiledRule::compile(&f.start_time)?,
            end_time: compile_opt(f.end_time.as_ref())?,
            description: compile_opt(f.description.as_ref())?,
            location: compile_opt(f.location.as_ref())?,
            url: compile_opt(f.url.as_ref())?,
            price: compile_opt(f.price.as_ref())?,
            image: compile_opt(f.image.as_ref())?,
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn extract_structured_page(body: &str, page_url: &Url, event_type: &str) -> Vec<ExtractedEvent> {
    let doc = Html::parse_document(body);
    structured_data::extract_events(&doc, page_url, event_type)
}

/// Apply a CSS strategy to one page.
fn extract_css_page(body: &str, page_url: &Url, css: &CssStrategy) -> Result<PageExtraction, AppError> {
    let doc = Html::parse_document(body);
    let container_selector = parse_selector(&css.event_container)?;
    let fields = CompiledFields::compile(css)?;

    let mut events = Vec::new();
    let mut containers = 0;
    for container in doc.select(&container_selector) {
        containers += 1;

        let title = fields.title.extract(container);
        if title.is_empty() {
            tracing::debug!(page_url = %page_url, index = containers, "Dropping record without title");
            continue;
        }
        let raw_start = fields.start_time.extract(container);
        if raw_start.is_empty() {
            tracing::debug!(page_url = %page_url, %title, "Dropping record without start time");
            continue;
        }
        let Some(start_time) = parse_datetime(&raw_start, &css.fields.start_time.format) else {
            tracing::debug!(
                page_url = %page_url,
                %title,
                raw = %raw_start,
                "Dropping record with unparseable start time"
            );
            continue;
        };

        let mut event = ExtractedEvent::new(title, start_time, page_url.as_str());

        if let (Some(rule), Some(end_rule)) = (&fields.end_time, &css.fields.end_time) {
            event.end_time = parse_datetime(&rule.extract(container), &end_rule.format);
        }
        event.description = fields
            .description
            .as_ref()
            .and_then(|r| non_empty(r.extract(container)));
        event.location_name = fields
            .location
            .as_ref()
            .and_then(|r| non_empty(r.extract(container)));
        event.url = fields
            .url
            .as_ref()
            .and_then(|r| resolve_url(page_url, &r.extract(container)));
        event.image_url = fields
            .image
            .as_ref()
            .and_then(|r| resolve_url(page_url, &r.extract(container)));

        let price_text = fields
            .price
            .as_ref()
            .map(|r| r.extract(container))
            .unwrap_or_default();
        let price = parse_price(&price_text);
        event.is_free = price.is_free;
        event.price_min = price.price_min;

        events.push(event);
    }

    let next_url = match css.pagination.next_selector.as_deref() {
        Some(selector) if !selector.trim().is_empty() => {
            let selector = parse_selector(selector)?;
            doc.select(&selector)
                .next()
                .and_then(|a| a.value().attr("href"))
                .and_then(|href| resolve_url(page_url, href))
        }
        _ => None,
    };

    Ok(PageExtraction {
        events,
        containers,
        next_url,
    })
}

/// Executes recipes against live pages.
#[derive(Clone)]
pub struct ReplayEngine<F: Fetcher> {
    fetcher: F,
}

impl<F: Fetcher> ReplayEngine<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    /// Run `recipe` against `url`.
    ///
    /// Fetch errors abort the replay. Zero matching containers is an empty
    /// result, not an error.
    pub async fn replay(&self, url: &str, recipe: &Recipe) -> Result<Vec<ExtractedEvent>, AppError> {
        let start = Url::parse(url).map_err(|e| AppError::invalid_url(url, e.to_string()))?;

        let events = match recipe.strategy() {
            Strategy::StructuredData(sd) => {
                let body = self.fetcher.fetch(start.as_str()).await?;
                extract_structured_page(&body, &start, &sd.event_type)
            }
            Strategy::Css(css) => self.replay_css(start, css).await?,
        };

        tracing::info!(
            %url,
            strategy = %recipe.kind(),
            events = events.len(),
            "Replay complete"
        );
        Ok(events)
    }

    async fn replay_css(&self, start: Url, css: &CssStrategy) -> Result<Vec<ExtractedEvent>, AppError> {
        let max_pages = css.pagination.max_pages.max(1);
        let mut visited: HashSet<String> = HashSet::new();
        let mut events = Vec::new();
        let mut page_url = start;
        let mut pages = 0u32;

        loop {
            visited.insert(page_url.to_string());
            let body = self.fetcher.fetch(page_url.as_str()).await?;
            pages += 1;

            let page = extract_css_page(&body, &page_url, css)?;
            tracing::debug!(
                page_url = %page_url,
                page = pages,
                containers = page.containers,
                events = page.events.len(),
                "Extracted page"
            );
            events.extend(page.events);

            if pages >= max_pages {
                break;
            }
            let Some(next) = page.next_url else {
                break;
            };
            if visited.contains(&next) {
                tracing::debug!(next = %next, "Pagination loops back to a visited page");
                break;
            }
            page_url = Url::parse(&next).map_err(|e| AppError::invalid_url(&next, e.to_string()))?;
        }

        Ok(events)
    }
}
