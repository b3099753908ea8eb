use scraper::{ElementRef, Html, Node, Selector};
use scout_core::error::AppError;
use scout_core::extract::{normalize_whitespace, parse_selector};
use scout_core::traits::Cleaner;

/// Roughly 6K tokens of markup.
pub const DEFAULT_MAX_CHARS: usize = 24_000;

const STRIP_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "iframe", "noscript", "svg", "form", "button",
    "input", "select",
];

/// Matched against whole `-`/`_` separated words of a class name.
const NOISE_CLASSES: &[&str] = &[
    "cookie",
    "cookies",
    "banner",
    "advertisement",
    "advert",
    "ad",
    "ads",
    "sidebar",
    "popup",
    "modal",
    "newsletter",
    "social",
    "share",
];

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "link", "meta", "source", "track", "wbr",
];

/// Reduces a page to the markup an LLM needs to write selectors.
///
/// Output stays HTML (tags, classes and attributes are what selectors are
/// written against), minus chrome and boilerplate, whitespace-collapsed and
/// truncated.
#[derive(Debug, Clone)]
pub struct HtmlCleaner {
    max_chars: usize,
    main: Selector,
    body: Selector,
}

impl HtmlCleaner {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            max_chars: DEFAULT_MAX_CHARS,
            main: parse_selector("main")?,
            body: parse_selector("body")?,
        })
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

fn is_noise(element: ElementRef<'_>) -> bool {
    let value = element.value();
    if STRIP_TAGS.contains(&value.name()) {
        return true;
    }
    value.classes().any(|class| {
        class
            .split(['-', '_'])
            .any(|word| NOISE_CLASSES.iter().any(|noise| word.eq_ignore_ascii_case(noise)))
    })
}

fn escape(text: &str, out: &mut String, in_attribute: bool) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if in_attribute => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

fn render(element: ElementRef<'_>, out: &mut String) {
    let value = element.value();
    let name = value.name();

    out.push('<');
    out.push_str(name);
    for (attr, attr_value) in value.attrs() {
        if attr == "style" || attr.starts_with("on") {
            continue;
        }
        out.push(' ');
        out.push_str(attr);
        out.push_str("=\"");
        escape(attr_value, out, true);
        out.push('"');
    }
    out.push('>');

    if VOID_TAGS.contains(&name) {
        return;
    }

    for child in element.children() {
        match child.value() {
            Node::Text(text) => escape(text, out, false),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    if !is_noise(child) {
                        render(child, out);
                    }
                }
            }
            _ => {}
        }
    }

    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn truncate_chars(text: String, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text,
    }
}

impl Cleaner for HtmlCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        let doc = Html::parse_document(html);
        let root = doc
            .select(&self.main)
            .next()
            .or_else(|| doc.select(&self.body).next())
            .unwrap_or_else(|| doc.root_element());

        let mut out = String::with_capacity(html.len().min(self.max_chars * 2));
        render(root, &mut out);
        Ok(truncate_chars(normalize_whitespace(&out), self.max_chars))
    }
}
