//! Recipe model: the persisted, versioned description of how to pull event
//! records out of one site's pages.
//!
//! A [`Recipe`] carries exactly one strategy payload. The persisted JSON shape
//! keeps the payload under a key named after the strategy:
//!
//! ```json
//! {
//!   "version": 1,
//!   "strategy": "css",
//!   "analyzed_at": "2026-03-01T12:00:00Z",
//!   "confidence": 0.8,
//!   "notes": "cards in main grid",
//!   "css": { "event_container": "div.event", "fields": { ... } }
//! }
//! ```
//!
//! Documents where `strategy` and payload disagree are rejected when parsed;
//! nothing is coerced.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Current recipe format tag.
pub const RECIPE_VERSION: u32 = 1;

/// Default pagination page budget.
pub const DEFAULT_MAX_PAGES: u32 = 3;

/// Default structured-data type to match.
pub const DEFAULT_EVENT_TYPE: &str = "Event";

/// Extraction strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Css,
    #[serde(alias = "jsonld")]
    StructuredData,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Css => "css",
            StrategyKind::StructuredData => "structured-data",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "css" => Ok(StrategyKind::Css),
            "structured-data" | "jsonld" => Ok(StrategyKind::StructuredData),
            _ => Err(format!("Unknown strategy: {s}")),
        }
    }
}

/// How a field's raw text should be parsed as a date/time.
///
/// Persisted as `"iso"`, `"human"` or a strftime pattern. Keywords are
/// case-insensitive; a string with no `%` directive is not a usable pattern
/// and reads as `human`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum FieldFormat {
    /// ISO-8601 / RFC 3339.
    Iso,
    /// Tolerant parsing of common human-written dates.
    #[default]
    Human,
    /// A chrono strftime pattern, e.g. `%m/%d/%Y %H:%M`.
    Pattern(String),
}

impl FieldFormat {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("iso") {
            FieldFormat::Iso
        } else if trimmed.contains('%') {
            FieldFormat::Pattern(raw.to_string())
        } else {
            FieldFormat::Human
        }
    }

    /// A `Pattern` must survive being written out and read back.
    fn check(&self) -> Result<(), AppError> {
        match self {
            FieldFormat::Pattern(p) if FieldFormat::parse(p) != *self => Err(
                AppError::ParseError(format!("date pattern '{p}' has no % directive")),
            ),
            _ => Ok(()),
        }
    }
}

impl From<Option<String>> for FieldFormat {
    fn from(value: Option<String>) -> Self {
        value.map_or(FieldFormat::Human, |s| FieldFormat::parse(&s))
    }
}

impl From<FieldFormat> for String {
    fn from(value: FieldFormat) -> Self {
        match value {
            FieldFormat::Iso => "iso".to_string(),
            FieldFormat::Human => "human".to_string(),
            FieldFormat::Pattern(p) => p,
        }
    }
}

/// Extraction instruction for a single field inside an event container.
///
/// `selector = None` means the field is not present on the page; `attr = None`
/// means the element's text content is used.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldRule {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub attr: Option<String>,
    #[serde(default)]
    pub format: FieldFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl FieldRule {
    /// Rule reading the text content of `selector`.
    pub fn text(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            ..Self::default()
        }
    }

    /// Rule reading attribute `attr` of `selector`.
    pub fn attr(selector: impl Into<String>, attr: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            attr: Some(attr.into()),
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: FieldFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Per-field rules. `title` and `start_time` are mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CssFields {
    pub title: FieldRule,
    pub start_time: FieldRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<FieldRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<FieldRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<FieldRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<FieldRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<FieldRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<FieldRule>,
}

impl CssFields {
    /// Every rule that is set, title first.
    pub fn rules(&self) -> impl Iterator<Item = &FieldRule> {
        [&self.title, &self.start_time]
            .into_iter()
            .chain(
                [
                    &self.description,
                    &self.end_time,
                    &self.location,
                    &self.url,
                    &self.price,
                    &self.image,
                ]
                .into_iter()
                .flatten(),
            )
    }

    pub fn new(title: FieldRule, start_time: FieldRule) -> Self {
        Self {
            title,
            start_time,
            description: None,
            end_time: None,
            location: None,
            url: None,
            price: None,
            image: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pagination {
    #[serde(default)]
    pub next_selector: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            next_selector: None,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CssStrategy {
    pub event_container: String,
    pub fields: CssFields,
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredDataStrategy {
    #[serde(default = "default_event_type")]
    pub event_type: String,
}

fn default_event_type() -> String {
    DEFAULT_EVENT_TYPE.to_string()
}

impl Default for StructuredDataStrategy {
    fn default() -> Self {
        Self {
            event_type: default_event_type(),
        }
    }
}

/// The strategy payload of a recipe.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    Css(CssStrategy),
    StructuredData(StructuredDataStrategy),
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Css(_) => StrategyKind::Css,
            Strategy::StructuredData(_) => StrategyKind::StructuredData,
        }
    }
}

/// A generated extraction recipe.
///
/// Recipes are immutable once accepted; re-analysis produces a new one. The
/// only mutation offered is [`Recipe::capped`], which the validation gate
/// uses to lower confidence and append a warning to the notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RecipeDocument", into = "RecipeDocument")]
pub struct Recipe {
    version: u32,
    analyzed_at: DateTime<Utc>,
    confidence: f64,
    notes: String,
    strategy: Strategy,
}

impl Recipe {
    pub fn new(
        strategy: Strategy,
        confidence: f64,
        notes: impl Into<String>,
        analyzed_at: DateTime<Utc>,
    ) -> Result<Self, AppError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(AppError::ParseError(format!(
                "confidence {confidence} is outside [0, 1]"
            )));
        }
        if let Strategy::Css(css) = &strategy {
            if css.event_container.trim().is_empty() {
                return Err(AppError::ParseError(
                    "css.event_container must not be empty".into(),
                ));
            }
            if css.pagination.max_pages == 0 {
                return Err(AppError::ParseError(
                    "css.pagination.max_pages must be at least 1".into(),
                ));
            }
            for rule in css.fields.rules() {
                rule.format.check()?;
            }
        }

        Ok(Self {
            version: RECIPE_VERSION,
            analyzed_at,
            confidence,
            notes: notes.into(),
            strategy,
        })
    }

    /// Structured-data recipe for the given schema type.
    pub fn structured_data(
        event_type: impl Into<String>,
        confidence: f64,
        notes: impl Into<String>,
    ) -> Result<Self, AppError> {
        Self::new(
            Strategy::StructuredData(StructuredDataStrategy {
                event_type: event_type.into(),
            }),
            confidence,
            notes,
            Utc::now(),
        )
    }

    pub fn css(
        css: CssStrategy,
        confidence: f64,
        notes: impl Into<String>,
    ) -> Result<Self, AppError> {
        Self::new(Strategy::Css(css), confidence, notes, Utc::now())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn analyzed_at(&self) -> DateTime<Utc> {
        self.analyzed_at
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn css_strategy(&self) -> Option<&CssStrategy> {
        match &self.strategy {
            Strategy::Css(css) => Some(css),
            Strategy::StructuredData(_) => None,
        }
    }

    /// Lower confidence to at most `limit` and append `warning` to the notes.
    ///
    /// Never raises confidence.
    pub fn capped(mut self, limit: f64, warning: &str) -> Self {
        self.confidence = self.confidence.min(limit);
        if !self.notes.is_empty() {
            self.notes.push(' ');
        }
        self.notes.push_str(&format!("[WARN: {warning}]"));
        self
    }

    /// True when the recipe may be scheduled for replay.
    pub fn is_accepted(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw).map_err(|e| AppError::ParseError(format!("invalid recipe: {e}")))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, AppError> {
        serde_json::from_value(value)
            .map_err(|e| AppError::ParseError(format!("invalid recipe: {e}")))
    }
}

// -- Persisted document shape --

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeDocument {
    #[serde(default = "default_version")]
    version: u32,
    strategy: StrategyKind,
    analyzed_at: DateTime<Utc>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    css: Option<CssStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "jsonld")]
    structured_data: Option<StructuredDataStrategy>,
}

fn default_version() -> u32 {
    RECIPE_VERSION
}

impl TryFrom<RecipeDocument> for Recipe {
    type Error = AppError;

    fn try_from(doc: RecipeDocument) -> Result<Self, Self::Error> {
        let strategy = match (doc.strategy, doc.css, doc.structured_data) {
            (StrategyKind::Css, Some(css), None) => Strategy::Css(css),
            (StrategyKind::StructuredData, None, Some(sd)) => Strategy::StructuredData(sd),
            (kind, css, sd) => {
                return Err(AppError::ParseError(format!(
                    "strategy '{kind}' requires exactly its own payload (css: {}, structured_data: {})",
                    if css.is_some() { "present" } else { "absent" },
                    if sd.is_some() { "present" } else { "absent" },
                )));
            }
        };

        let mut recipe = Recipe::new(strategy, doc.confidence, doc.notes, doc.analyzed_at)?;
        recipe.version = doc.version;
        Ok(recipe)
    }
}

impl From<Recipe> for RecipeDocument {
    fn from(recipe: Recipe) -> Self {
        let kind = recipe.kind();
        let (css, structured_data) = match recipe.strategy {
            Strategy::Css(css) => (Some(css), None),
            Strategy::StructuredData(sd) => (None, Some(sd)),
        };
        RecipeDocument {
            version: recipe.version,
            strategy: kind,
            analyzed_at: recipe.analyzed_at,
            confidence: recipe.confidence,
            notes: recipe.notes,
            css,
            structured_data,
        }
    }
}

// -- LLM candidates --

/// JSON Schema a generated candidate must satisfy before it is deserialized.
pub static CANDIDATE_SCHEMA: LazyLock<serde_json::Value> = LazyLock::new(|| {
    let rule = serde_json::json!({
        "type": ["object", "null"],
        "additionalProperties": false,
        "properties": {
            "selector": {"type": ["string", "null"]},
            "attr": {"type": ["string", "null"]},
            "format": {"type": ["string", "null"]},
            "default": {"type": ["string", "null"]}
        }
    });
    let required_rule = serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": rule["properties"].clone()
    });

    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["strategy", "confidence", "css"],
        "properties": {
            "strategy": {"const": "css"},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "notes": {"type": ["string", "null"]},
            "css": {
                "type": "object",
                "additionalProperties": false,
                "required": ["event_container", "fields"],
                "properties": {
                    "event_container": {"type": "string", "minLength": 1},
                    "fields": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["title", "start_time"],
                        "properties": {
                            "title": required_rule.clone(),
                            "start_time": required_rule,
                            "description": rule.clone(),
                            "end_time": rule.clone(),
                            "location": rule.clone(),
                            "url": rule.clone(),
                            "price": rule.clone(),
                            "image": rule
                        }
                    },
                    "pagination": {
                        "type": ["object", "null"],
                        "additionalProperties": false,
                        "properties": {
                            "next_selector": {"type": ["string", "null"]},
                            "max_pages": {"type": "integer", "minimum": 1, "maximum": 50}
                        }
                    }
                }
            }
        }
    })
});

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeCandidate {
    #[allow(dead_code)]
    strategy: StrategyKind,
    confidence: f64,
    #[serde(default)]
    notes: Option<String>,
    css: CandidateCss,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CandidateCss {
    event_container: String,
    fields: CssFields,
    #[serde(default)]
    pagination: Option<Pagination>,
}

impl Recipe {
    /// Parse an LLM-generated candidate.
    ///
    /// The reply is checked against [`CANDIDATE_SCHEMA`] and then deserialized
    /// strictly; any mismatch is a [`AppError::ParseError`].
    pub fn from_candidate(value: &serde_json::Value) -> Result<Self, AppError> {
        let validator = jsonschema::validator_for(&CANDIDATE_SCHEMA)
            .map_err(|e| AppError::Generic(format!("candidate schema is invalid: {e}")))?;

        let violations: Vec<String> = validator
            .iter_errors(value)
            .map(|e| e.to_string())
            .collect();
        if !violations.is_empty() {
            return Err(AppError::ParseError(format!(
                "generated recipe does not match schema: {}",
                violations.join("; ")
            )));
        }

        let candidate: RecipeCandidate = serde_json::from_value(value.clone())
            .map_err(|e| AppError::ParseError(format!("generated recipe is malformed: {e}")))?;

        let css = CssStrategy {
            event_container: candidate.css.event_container,
            fields: candidate.css.fields,
            pagination: candidate.css.pagination.unwrap_or_default(),
        };

        Recipe::css(css, candidate.confidence, candidate.notes.unwrap_or_default())
    }
}
