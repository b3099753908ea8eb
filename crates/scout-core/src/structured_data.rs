//! JSON-LD (`<script type="application/ld+json">`) extraction.
//!
//! Used both by the analyzer probe and by structured-data replay.

use std::sync::LazyLock;

use scraper::{Html, Selector};
use serde_json::Value;
use url::Url;

use crate::extract::{normalize_whitespace, parse_datetime, parse_price, resolve_url};
use crate::models::ExtractedEvent;
use crate::recipe::FieldFormat;

/// Maximum description length kept from structured data, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 2000;

static LD_JSON: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("valid ld+json selector")
});

/// Parse every JSON-LD block on the page. Malformed blocks are skipped.
fn blocks(doc: &Html) -> Vec<Value> {
    doc.select(&LD_JSON)
        .filter_map(|script| {
            let raw = script.text().collect::<String>();
            match serde_json::from_str::<Value>(raw.trim()) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed JSON-LD block");
                    None
                }
            }
        })
        .collect()
}

/// Flatten a block into candidate items: a single object, an array of
/// objects, or an `@graph` container.
fn flatten<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| flatten(item, out)),
        Value::Object(map) => {
            if let Some(graph) = map.get("@graph") {
                flatten(graph, out);
            }
            if map.contains_key("@type") {
                out.push(value);
            }
        }
        _ => {}
    }
}

fn type_matches(raw: &str, event_type: &str) -> bool {
    let local = raw
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(raw);
    local == event_type
}

/// `@type` may be a string or an array of strings.
fn has_type(item: &Value, event_type: &str) -> bool {
    match item.get("@type") {
        Some(Value::String(t)) => type_matches(t, event_type),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| type_matches(t, event_type)),
        _ => false,
    }
}

/// All JSON-LD items of `event_type` on the page, in document order.
pub fn find_items(doc: &Html, event_type: &str) -> Vec<Value> {
    let blocks = blocks(doc);
    let mut items = Vec::new();
    for block in &blocks {
        flatten(block, &mut items);
    }
    items
        .into_iter()
        .filter(|item| has_type(item, event_type))
        .cloned()
        .collect()
}

/// Number of JSON-LD items of `event_type` on the page.
pub fn count_items(doc: &Html, event_type: &str) -> usize {
    find_items(doc, event_type).len()
}

/// Map every item of `event_type` to an event, dropping incomplete items.
pub fn extract_events(doc: &Html, page_url: &Url, event_type: &str) -> Vec<ExtractedEvent> {
    find_items(doc, event_type)
        .iter()
        .filter_map(|item| to_event(item, page_url))
        .collect()
}

fn string_field(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(s) => {
            let s = normalize_whitespace(s);
            (!s.is_empty()).then_some(s)
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// `image` may be a URL string, an array, or an `ImageObject`.
fn image_url(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Array(items) => items.iter().find_map(image_url),
        Value::Object(map) => map.get("url").and_then(Value::as_str),
        _ => None,
    }
}

/// `address` may be a plain string or a `PostalAddress`.
fn address(value: &Value) -> Option<String> {
    let address = match value {
        Value::String(s) => Some(normalize_whitespace(s)),
        Value::Object(_) => {
            let parts: Vec<String> = [
                "streetAddress",
                "addressLocality",
                "addressRegion",
                "postalCode",
            ]
            .iter()
            .filter_map(|k| string_field(value, k))
            .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    };
    address.filter(|s| !s.is_empty())
}

/// `(location_name, location_address)` from a `location` value.
fn location(value: &Value) -> (Option<String>, Option<String>) {
    match value {
        Value::String(s) => (Some(normalize_whitespace(s)).filter(|s| !s.is_empty()), None),
        Value::Array(items) => items.first().map(location).unwrap_or((None, None)),
        Value::Object(_) => (
            string_field(value, "name"),
            value.get("address").and_then(address),
        ),
        _ => (None, None),
    }
}

/// `(is_free, price_min)` from an `offers` value (object or array).
fn offers(value: &Value) -> (bool, Option<f64>) {
    let offers: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut is_free = false;
    let mut price_min: Option<f64> = None;
    for offer in offers {
        for key in ["price", "lowPrice"] {
            let price = match offer.get(key) {
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::String(s)) => {
                    let cleaned = s.trim().trim_start_matches('$').replace(',', "");
                    cleaned.parse::<f64>().ok().or_else(|| {
                        if parse_price(s).is_free {
                            Some(0.0)
                        } else {
                            None
                        }
                    })
                }
                _ => None,
            };
            if let Some(p) = price {
                price_min = Some(price_min.map_or(p, |m| m.min(p)));
            }
        }
        if offer.to_string().to_lowercase().contains("free") {
            is_free = true;
        }
    }

    match price_min {
        Some(p) if p <= 0.0 => (true, None),
        other => (is_free, other.filter(|_| !is_free)),
    }
}

fn to_event(item: &Value, page_url: &Url) -> Option<ExtractedEvent> {
    let Some(title) = string_field(item, "name") else {
        tracing::debug!(page_url = %page_url, "Dropping JSON-LD item without name");
        return None;
    };
    let Some(raw_start) = string_field(item, "startDate") else {
        tracing::debug!(page_url = %page_url, %title, "Dropping JSON-LD item without startDate");
        return None;
    };
    let Some(start_time) = parse_datetime(&raw_start, &FieldFormat::Iso) else {
        tracing::debug!(
            page_url = %page_url,
            %title,
            raw = %raw_start,
            "Dropping JSON-LD item with unparseable startDate"
        );
        return None;
    };

    let mut event = ExtractedEvent::new(title, start_time, page_url.as_str());
    event.end_time = string_field(item, "endDate")
        .and_then(|raw| parse_datetime(&raw, &FieldFormat::Iso));
    event.description = item
        .get("description")
        .and_then(Value::as_str)
        .map(|d| truncate_chars(d.trim(), MAX_DESCRIPTION_CHARS))
        .filter(|d| !d.is_empty());
    event.url = string_field(item, "url").and_then(|href| resolve_url(page_url, &href));
    event.image_url = item
        .get("image")
        .and_then(image_url)
        .and_then(|href| resolve_url(page_url, href));

    if let Some(loc) = item.get("location") {
        (event.location_name, event.location_address) = location(loc);
    }
    if let Some(o) = item.get("offers") {
        (event.is_free, event.price_min) = offers(o);
    }

    Some(event)
}
