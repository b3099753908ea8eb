//! Field extraction helpers.
//!
//! Everything here is pure: given a parsed element and a [`FieldRule`] the
//! result depends on nothing else. Format-specific parsing (dates, prices)
//! happens after the raw string is pulled out.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Selector};
use url::Url;

use crate::error::AppError;
use crate::recipe::{FieldFormat, FieldRule};

/// Parse a CSS selector, mapping failures to [`AppError::ParseError`].
pub fn parse_selector(selector: &str) -> Result<Selector, AppError> {
    Selector::parse(selector)
        .map_err(|e| AppError::ParseError(format!("invalid CSS selector '{selector}': {e}")))
}

/// A [`FieldRule`] with its selector compiled.
#[derive(Debug)]
pub struct CompiledRule<'r> {
    rule: &'r FieldRule,
    selector: Option<Selector>,
}

impl<'r> CompiledRule<'r> {
    pub fn compile(rule: &'r FieldRule) -> Result<Self, AppError> {
        let selector = match rule.selector.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => Some(parse_selector(s)?),
            _ => None,
        };
        Ok(Self { rule, selector })
    }

    /// Resolve selector → first element → attribute or text → default.
    pub fn extract(&self, container: ElementRef<'_>) -> String {
        let fallback = || self.rule.default.clone().unwrap_or_default();

        let Some(selector) = &self.selector else {
            return fallback();
        };
        let Some(found) = container.select(selector).next() else {
            return fallback();
        };

        let raw = match self.rule.attr.as_deref() {
            Some(attr) => found.value().attr(attr).map(str::trim).unwrap_or_default().to_string(),
            None => element_text(found),
        };

        if raw.is_empty() { fallback() } else { raw }
    }
}

/// Extract one field from a container element.
pub fn extract_field(container: ElementRef<'_>, rule: &FieldRule) -> Result<String, AppError> {
    Ok(CompiledRule::compile(rule)?.extract(container))
}

/// Text content of an element with whitespace collapsed.
pub fn element_text(element: ElementRef<'_>) -> String {
    normalize_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve `href` against the page it was found on.
///
/// Returns `None` for empty values and for non-HTTP schemes
/// (`javascript:`, `mailto:`, ...).
pub fn resolve_url(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let resolved = base.join(href).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

/// Price information parsed from a line item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Price {
    pub is_free: bool,
    pub price_min: Option<f64>,
}

static PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\s*(\d[\d,]*(?:\.\d+)?)").expect("valid price regex"));

/// Empty text or any "free" token ⇒ free. Otherwise the first `$<number>`
/// is the minimum price; no match leaves the price unset.
pub fn parse_price(text: &str) -> Price {
    let text = text.trim();
    if text.is_empty() || text.to_lowercase().contains("free") {
        return Price {
            is_free: true,
            price_min: None,
        };
    }

    let price_min = PRICE_RE
        .captures(text)
        .and_then(|c| c[1].replace(',', "").parse::<f64>().ok());

    Price {
        is_free: false,
        price_min,
    }
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

const ISO_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const ISO_OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%z",
    "%Y-%m-%d %H:%M:%S%z",
];

const HUMAN_DATETIME_FORMATS: &[&str] = &[
    "%B %d %Y %I:%M %p",
    "%B %d %Y %I %p",
    "%B %d %Y %H:%M",
    "%b %d %Y %I:%M %p",
    "%b %d %Y %I %p",
    "%b %d %Y %H:%M",
    "%A %B %d %Y %I:%M %p",
    "%A %B %d %Y %I %p",
    "%a %b %d %Y %I:%M %p",
    "%a %b %d %Y %I %p",
    "%d %B %Y %H:%M",
    "%d %b %Y %H:%M",
    "%d %B %Y %I:%M %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %I %p",
    "%m/%d/%Y %H:%M",
];

const HUMAN_DATE_FORMATS: &[&str] = &[
    "%B %d %Y",
    "%b %d %Y",
    "%A %B %d %Y",
    "%a %b %d %Y",
    "%d %B %Y",
    "%d %b %Y",
    "%m/%d/%Y",
];

static ORDINAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})(st|nd|rd|th)\b").expect("valid ordinal regex"));

static MERIDIEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d)\s*([ap])\.?\s?m\b\.?").expect("valid meridiem regex")
});

static CONNECTOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s(?:at|@|from)\s").expect("valid connector regex")
});

static RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*(?:-|–|—|\bto\b)\s*").expect("valid range regex"));

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4}\b").expect("valid year regex"));

// "Sat Mar 1 7 PM", "March 1", "1 March 19:30" once normalised.
static YEARLESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<weekday>[A-Za-z]+)\s+)?(?P<date>[A-Za-z]+\s+\d{1,2}|\d{1,2}\s+[A-Za-z]+)(?P<rest>\s.*)?$",
    )
    .expect("valid yearless date regex")
});

/// Parse a raw date/time string according to `format`.
///
/// Values without an offset are taken as UTC. Returns `None` when nothing
/// matches; callers drop the record rather than substituting "now".
pub fn parse_datetime(raw: &str, format: &FieldFormat) -> Option<DateTime<FixedOffset>> {
    parse_datetime_from(raw, format, Utc::now().date_naive())
}

/// [`parse_datetime`] with an explicit reference date.
///
/// Listings often omit the year ("Sat Mar 1, 7pm"). Such dates resolve to
/// the first occurrence on or after `today`.
pub fn parse_datetime_from(
    raw: &str,
    format: &FieldFormat,
    today: NaiveDate,
) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    match format {
        FieldFormat::Iso | FieldFormat::Human => {
            parse_iso(raw).or_else(|| parse_human(raw, today))
        }
        FieldFormat::Pattern(pattern) => parse_pattern(raw, pattern)
            .or_else(|| parse_iso(raw))
            .or_else(|| parse_human(raw, today)),
    }
}

fn parse_pattern(raw: &str, pattern: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(raw, pattern)
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, pattern)
                .ok()
                .map(|n| n.and_utc().fixed_offset())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(raw, pattern)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|n| n.and_utc().fixed_offset())
        })
}

fn parse_iso(raw: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt);
    }
    if let Some(dt) = ISO_OFFSET_FORMATS
        .iter()
        .find_map(|f| DateTime::parse_from_str(raw, f).ok())
    {
        return Some(dt);
    }
    if let Some(naive) = ISO_DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
    {
        return Some(naive.and_utc().fixed_offset());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc().fixed_offset())
}

fn normalize_human(raw: &str) -> String {
    let text = raw.replace(',', " ");
    let text = ORDINAL_RE.replace_all(&text, "$1");
    let text = MERIDIEM_RE.replace_all(&text, |c: &regex::Captures<'_>| {
        format!("{} {}M", &c[1], c[2].to_uppercase())
    });
    let text = CONNECTOR_RE.replace_all(&text, " ");
    normalize_whitespace(&text)
}

fn parse_human_exact(text: &str) -> Option<DateTime<FixedOffset>> {
    if let Some(naive) = HUMAN_DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
    {
        return Some(naive.and_utc().fixed_offset());
    }
    HUMAN_DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc().fixed_offset())
}

fn parse_human(raw: &str, today: NaiveDate) -> Option<DateTime<FixedOffset>> {
    let text = normalize_human(raw);
    if let Some(dt) = parse_human_exact(&text) {
        return Some(dt);
    }

    // "March 1 2026 7 PM - 9 PM": keep the start of the range.
    let head = RANGE_RE.split(&text).next()?.trim();
    if head != text {
        if let Some(dt) = parse_human_exact(head) {
            return Some(dt);
        }
    }

    parse_without_year(&text, today).or_else(|| {
        if head != text {
            parse_without_year(head, today)
        } else {
            None
        }
    })
}

fn parse_without_year(text: &str, today: NaiveDate) -> Option<DateTime<FixedOffset>> {
    if YEAR_RE.is_match(text) {
        return None;
    }
    let caps = YEARLESS_RE.captures(text)?;
    let date = caps.name("date")?.as_str();
    let rest = caps.name("rest").map_or("", |m| m.as_str());
    let weekday = caps.name("weekday").map(|m| m.as_str());

    let candidates = |weekday: Option<&str>| -> Vec<DateTime<FixedOffset>> {
        [today.year(), today.year() + 1]
            .into_iter()
            .filter_map(|year| {
                let dated = match weekday {
                    Some(day) => format!("{day} {date} {year}{rest}"),
                    None => format!("{date} {year}{rest}"),
                };
                parse_human_exact(&dated)
            })
            .collect()
    };

    // A weekday that contradicts both years is ignored rather than fatal.
    let mut found = candidates(weekday);
    if found.is_empty() && weekday.is_some() {
        found = candidates(None);
    }
    found
        .iter()
        .copied()
        .find(|dt| dt.date_naive() >= today)
        .or_else(|| found.first().copied())
}
