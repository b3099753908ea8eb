//! Page analyzer: produces a recipe for a page that has none.
//!
//! Structured data is probed first; only when the page carries none is the
//! LLM asked for a CSS recipe, which then passes through a validation gate
//! against the uncleaned page.

use scraper::Html;

use crate::error::AppError;
use crate::extract::{CompiledRule, parse_selector};
use crate::lifecycle::ACCEPTANCE_THRESHOLD;
use crate::recipe::{DEFAULT_EVENT_TYPE, FieldRule, Recipe, Strategy};
use crate::router::extract_domain;
use crate::structured_data;
use crate::traits::{Cleaner, Fetcher, RecipeGenerator};

/// Confidence cap when the container selector matches nothing.
pub const NO_CONTAINERS_CAP: f64 = 0.2;

/// Confidence cap when containers match but no title can be read.
pub const NO_TITLES_CAP: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Minimum confidence for a recipe to be scheduled.
    pub acceptance_threshold: f64,
    /// Confidence assigned to structured-data recipes.
    pub structured_data_confidence: f64,
    /// How many containers the title check looks at.
    pub title_probe_depth: usize,
    /// Schema.org type probed for.
    pub event_type: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: ACCEPTANCE_THRESHOLD,
            structured_data_confidence: 0.95,
            title_probe_depth: 5,
            event_type: DEFAULT_EVENT_TYPE.to_string(),
        }
    }
}

/// Generates recipes: fetch → structured-data probe → LLM → validation.
#[derive(Clone)]
pub struct PageAnalyzer<F, C, G>
where
    F: Fetcher,
    C: Cleaner,
    G: RecipeGenerator,
{
    fetcher: F,
    cleaner: C,
    generator: G,
    config: AnalyzerConfig,
}

impl<F, C, G> PageAnalyzer<F, C, G>
where
    F: Fetcher,
    C: Cleaner,
    G: RecipeGenerator,
{
    pub fn new(fetcher: F, cleaner: C, generator: G) -> Self {
        Self::with_config(fetcher, cleaner, generator, AnalyzerConfig::default())
    }

    pub fn with_config(fetcher: F, cleaner: C, generator: G, config: AnalyzerConfig) -> Self {
        Self {
            fetcher,
            cleaner,
            generator,
            config,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn is_accepted(&self, recipe: &Recipe) -> bool {
        recipe.is_accepted(self.config.acceptance_threshold)
    }

    /// Produce a recipe for `url`.
    ///
    /// A low-confidence recipe is a successful result; the caller decides
    /// acceptance. Fetch, provider and malformed-output failures are errors.
    pub async fn analyze(&self, url: &str) -> Result<Recipe, AppError> {
        extract_domain(url)?;

        // Step 1: Fetch
        tracing::info!(%url, "Fetching page for analysis");
        let html = self.fetcher.fetch(url).await?;

        // Step 2: Structured-data probe
        if let Some(recipe) = self.probe_structured_data(&html)? {
            tracing::info!(
                %url,
                confidence = recipe.confidence(),
                "Structured data found, skipping LLM"
            );
            return Ok(recipe);
        }

        // Step 3: Clean
        let cleaned = self.cleaner.clean(&html)?;
        tracing::debug!(
            %url,
            raw_len = html.len(),
            cleaned_len = cleaned.len(),
            "Cleaned page for recipe generation"
        );

        // Step 4: Generate
        let reply = self.generator.generate(url, &cleaned).await?;
        let candidate = Recipe::from_candidate(&reply)?;

        // Step 5: Validate against the uncleaned page
        let recipe = self.validate(&html, candidate)?;
        tracing::info!(
            %url,
            confidence = recipe.confidence(),
            accepted = self.is_accepted(&recipe),
            "Recipe generated"
        );
        Ok(recipe)
    }

    /// Structured-data recipe when the page carries items of the target type.
    pub fn probe_structured_data(&self, html: &str) -> Result<Option<Recipe>, AppError> {
        let doc = Html::parse_document(html);
        let count = structured_data::count_items(&doc, &self.config.event_type);
        if count == 0 {
            return Ok(None);
        }

        Recipe::structured_data(
            self.config.event_type.clone(),
            self.config.structured_data_confidence,
            format!("Found {count} JSON-LD {} item(s)", self.config.event_type),
        )
        .map(Some)
    }

    /// Probe a CSS candidate against the page and cap its confidence when
    /// its selectors do not hold up. Never raises confidence.
    pub fn validate(&self, html: &str, recipe: Recipe) -> Result<Recipe, AppError> {
        let Strategy::Css(css) = recipe.strategy() else {
            return Ok(recipe);
        };

        let doc = Html::parse_document(html);
        let container_selector = parse_selector(&css.event_container)?;
        let containers: Vec<_> = doc.select(&container_selector).collect();

        if containers.is_empty() {
            let warning = format!("event_container '{}' matched 0 elements", css.event_container);
            tracing::warn!(selector = %css.event_container, "Validation: no containers");
            return Ok(recipe.clone().capped(NO_CONTAINERS_CAP, &warning));
        }

        // A default would mask a selector that reads nothing.
        let title_rule = FieldRule {
            default: None,
            ..css.fields.title.clone()
        };
        let title = CompiledRule::compile(&title_rule)?;
        let depth = self.config.title_probe_depth.max(1);
        let has_title = containers
            .iter()
            .take(depth)
            .any(|c| !title.extract(*c).is_empty());

        if !has_title {
            let warning = format!(
                "title selector {:?} yielded no text in the first {} containers",
                css.fields.title.selector.as_deref().unwrap_or(""),
                depth.min(containers.len())
            );
            tracing::warn!(containers = containers.len(), "Validation: no titles");
            return Ok(recipe.clone().capped(NO_TITLES_CAP, &warning));
        }

        tracing::debug!(containers = containers.len(), "Validation passed");
        Ok(recipe)
    }
}
