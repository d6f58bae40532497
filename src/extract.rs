//! Best-effort content extraction from release-page HTML.
//!
//! Government release pages are inconsistently structured: some carry full
//! JSON-LD article objects, some only social-sharing meta tags, some nothing
//! but markup soup. Every field here is produced by an ordered strategy
//! cascade. The first strategy yielding a non-empty, minimally valid value
//! wins; later entries are pure fallback and never merged.
//!
//! [`Extractor::extract`] is total: any input, including empty or non-HTML
//! bytes, produces an [`ExtractionResult`] (worst case: the caller's
//! fallback title and empty fields). Per-field misses are normal, not
//! errors.

use crate::config::ExtractConfig;
use crate::models::ExtractionResult;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::VecDeque;
use std::error::Error;
use tracing::debug;
use url::Url;

const ARTICLE_TYPES: &[&str] = &["NewsArticle", "Article", "Report", "BlogPosting"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Configured HTML extractor. One instance serves the whole run.
pub struct Extractor {
    config: ExtractConfig,
    handler_re: Regex,
}

impl Extractor {
    /// Build an extractor; fails only on an invalid handler-redirector
    /// pattern in config.
    pub fn new(config: ExtractConfig, handler_pattern: &str) -> Result<Self, Box<dyn Error>> {
        let handler_re = Regex::new(handler_pattern)?;
        Ok(Self { config, handler_re })
    }

    /// Extract title, description, body, image candidate and raw date
    /// candidates from one page.
    pub fn extract(&self, html: &str, page_url: &str, fallback_title: &str) -> ExtractionResult {
        let document = Html::parse_document(html);

        let title = self.title(&document, fallback_title);
        let description = self.description(&document);
        let body_text = self.body(&document);
        let (image_url, handler_url) = self.image(&document, page_url);
        let date_candidates = self.date_candidates(&document, &title);

        debug!(
            title_len = title.len(),
            body_len = body_text.len(),
            has_image = image_url.is_some(),
            has_handler = handler_url.is_some(),
            date_candidates = date_candidates.len(),
            "Extracted page"
        );

        ExtractionResult {
            title,
            description,
            body_text,
            image_url,
            handler_url,
            date_candidates,
        }
    }

    // ----- TITLE -----

    fn title(&self, document: &Html, fallback: &str) -> String {
        meta_content(document, r#"meta[property="og:title"]"#)
            .or_else(|| meta_content(document, r#"meta[name="twitter:title"]"#))
            .or_else(|| text_of_first(document, "h1"))
            .or_else(|| {
                self.config
                    .heading_selectors
                    .iter()
                    .find_map(|css| text_of_first(document, css))
            })
            .unwrap_or_else(|| clean(fallback))
    }

    // ----- DESCRIPTION -----

    fn description(&self, document: &Html) -> String {
        meta_content(document, r#"meta[name="description"]"#)
            .or_else(|| meta_content(document, r#"meta[property="og:description"]"#))
            .or_else(|| meta_content(document, r#"meta[name="twitter:description"]"#))
            .or_else(|| first_paragraph(document))
            .unwrap_or_default()
    }

    // ----- BODY -----

    fn body(&self, document: &Html) -> String {
        // Structured data first; release pages that carry it carry the whole
        // body there.
        if let Some(body) = jsonld_article_body(document) {
            if body.chars().count() >= self.config.min_body_length {
                return cap_chars(&body, self.config.max_body_length);
            }
        }

        // DOM extraction inside the first content container that yields
        // enough text.
        for css in &self.config.content_selectors {
            let Ok(sel) = Selector::parse(css) else {
                continue;
            };
            if let Some(container) = document.select(&sel).next() {
                let text = container_text(&container);
                if text.chars().count() >= self.config.min_body_length {
                    return cap_chars(&text, self.config.max_body_length);
                }
            }
        }

        // Last resort: first N paragraphs anywhere on the page.
        let p_sel = Selector::parse("p").unwrap();
        let parts: Vec<String> = document
            .select(&p_sel)
            .filter(|p| !in_chrome_region(p))
            .map(|p| clean(&p.text().collect::<Vec<_>>().join(" ")))
            .filter(|t| !t.is_empty())
            .take(self.config.max_fallback_paragraphs)
            .collect();

        cap_chars(&parts.join("\n\n"), self.config.max_body_length)
    }

    // ----- IMAGE -----

    /// Scan image candidates in priority order. Returns the first direct
    /// image URL plus the first handler-redirector URL seen along the way;
    /// a handler URL is never returned as the direct image.
    fn image(&self, document: &Html, page_url: &str) -> (Option<String>, Option<String>) {
        let base = Url::parse(page_url).ok();
        let mut handler_url: Option<String> = None;

        for candidate in image_candidates(document) {
            let Some(resolved) = resolve_url(base.as_ref(), &candidate) else {
                continue;
            };
            if self.handler_re.is_match(&resolved) {
                if handler_url.is_none() {
                    handler_url = Some(resolved);
                }
                continue;
            }
            if has_image_extension(&resolved) {
                return (Some(resolved), handler_url);
            }
        }

        (None, handler_url)
    }

    // ----- DATE CANDIDATES -----

    /// Collect raw date strings in normalizer priority order; nothing is
    /// parsed here. The page title rides along as the last-resort candidate.
    fn date_candidates(&self, document: &Html, title: &str) -> Vec<String> {
        let mut candidates = Vec::new();

        for raw in jsonld_dates(document) {
            candidates.push(raw);
        }

        for css in [
            r#"meta[property="article:published_time"]"#,
            r#"meta[itemprop="datePublished"]"#,
            r#"meta[name="date"]"#,
            r#"meta[property="og:updated_time"]"#,
        ] {
            if let Some(raw) = meta_content(document, css) {
                candidates.push(raw);
            }
        }

        if let Ok(sel) = Selector::parse("time[datetime]") {
            if let Some(t) = document.select(&sel).next() {
                if let Some(raw) = t.value().attr("datetime") {
                    let raw = clean(raw);
                    if !raw.is_empty() {
                        candidates.push(raw);
                    }
                }
            }
        }

        for css in &self.config.date_text_selectors {
            if let Some(raw) = text_of_first(document, css) {
                candidates.push(raw);
            }
        }

        if !title.is_empty() {
            candidates.push(title.to_string());
        }

        candidates
    }
}

/* -------------------- DOM HELPERS -------------------- */

fn clean(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cap_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// First match's `content` attribute, whitespace-normalized; `None` when
/// missing or empty.
fn meta_content(document: &Html, css: &str) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    let n = document.select(&sel).next()?;
    let v = clean(n.value().attr("content")?);
    (!v.is_empty()).then_some(v)
}

/// First match's text content, whitespace-normalized; `None` when missing
/// or empty.
fn text_of_first(document: &Html, css: &str) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    let n = document.select(&sel).next()?;
    let v = clean(&n.text().collect::<Vec<_>>().join(" "));
    (!v.is_empty()).then_some(v)
}

fn first_paragraph(document: &Html) -> Option<String> {
    let sel = Selector::parse("p").ok()?;
    document
        .select(&sel)
        .map(|p| clean(&p.text().collect::<Vec<_>>().join(" ")))
        .find(|t| !t.is_empty())
}

/// True when the node or any ancestor is page chrome (nav bars, sidebars,
/// footers) rather than article content.
fn in_chrome_region(el: &ElementRef) -> bool {
    fn is_chrome(el: ElementRef) -> bool {
        if matches!(el.value().name(), "nav" | "aside" | "footer" | "header") {
            return true;
        }
        el.value().attr("class").is_some_and(|classes| {
            classes.split_whitespace().any(|c| {
                let c = c.to_ascii_lowercase();
                matches!(
                    c.as_str(),
                    "nav" | "navbar" | "sidebar" | "menu" | "footer" | "header"
                )
            })
        })
    }

    if is_chrome(*el) {
        return true;
    }
    el.ancestors().filter_map(ElementRef::wrap).any(is_chrome)
}

/// Collect readable text inside one content container: paragraphs, list
/// items and leaf divs, in document order, skipping chrome regions and any
/// node whose text an earlier-collected ancestor already covers.
fn container_text(container: &ElementRef) -> String {
    let inner = Selector::parse("p, li, div").unwrap();
    let block = Selector::parse("p, li, div, ul, ol").unwrap();

    let mut parts = Vec::new();
    for node in container.select(&inner) {
        if in_chrome_region(&node) {
            continue;
        }
        // Only leaf-level nodes contribute text; anything with block
        // descendants is covered by those descendants.
        if node.select(&block).next().is_some() {
            continue;
        }
        let text = clean(&node.text().collect::<Vec<_>>().join(" "));
        if !text.is_empty() {
            parts.push(text);
        }
    }
    parts.join("\n\n")
}

fn image_candidates(document: &Html) -> Vec<String> {
    let mut out = Vec::new();

    for css in [
        r#"meta[property="og:image"]"#,
        r#"meta[name="twitter:image"]"#,
    ] {
        if let Some(v) = meta_content(document, css) {
            out.push(v);
        }
    }

    for css in [
        "article img[src]",
        "main img[src]",
        "figure img[src]",
        ".media img[src]",
        "img[src]",
    ] {
        let Ok(sel) = Selector::parse(css) else {
            continue;
        };
        for img in document.select(&sel) {
            if let Some(src) = img.value().attr("src") {
                let src = src.trim();
                if !src.is_empty() {
                    out.push(src.to_string());
                }
            }
        }
    }

    // File-path heuristic: plain links pointing straight at image files.
    if let Ok(sel) = Selector::parse("a[href]") {
        for a in document.select(&sel) {
            if let Some(href) = a.value().attr("href") {
                let lower = href.to_ascii_lowercase();
                if IMAGE_EXTENSIONS
                    .iter()
                    .any(|ext| lower.split('?').next().unwrap_or("").ends_with(&format!(".{ext}")))
                {
                    out.push(href.trim().to_string());
                }
            }
        }
    }

    out
}

fn resolve_url(base: Option<&Url>, candidate: &str) -> Option<String> {
    match base {
        Some(base) => base.join(candidate).ok().map(|u| u.to_string()),
        None => Url::parse(candidate).ok().map(|u| u.to_string()),
    }
}

/// Path ends in a recognized image extension; query string ignored.
pub(crate) fn has_image_extension(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let path = parsed.path().to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(&format!(".{ext}")))
}

/* -------------------- JSON-LD HELPERS -------------------- */

fn jsonld_blocks(document: &Html) -> Vec<Value> {
    let mut out = Vec::new();
    let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return out;
    };
    for script in document.select(&sel) {
        if let Some(js) = script
            .first_child()
            .and_then(|n| n.value().as_text())
            .map(|t| t.to_string())
        {
            let txt = js.trim();
            if txt.is_empty() {
                continue;
            }
            if let Ok(v) = serde_json::from_str::<Value>(txt) {
                out.push(v);
            }
        }
    }
    out
}

/// Breadth-first search through `@graph`/array containers for the first
/// article-typed object carrying an `articleBody`.
fn jsonld_article_body(document: &Html) -> Option<String> {
    for block in jsonld_blocks(document) {
        let mut queue: VecDeque<&Value> = VecDeque::from([&block]);
        while let Some(v) = queue.pop_front() {
            match v {
                Value::Array(arr) => queue.extend(arr.iter()),
                Value::Object(map) => {
                    if is_article_type(map.get("@type")) {
                        if let Some(body) = map.get("articleBody").and_then(|b| b.as_str()) {
                            let body = body.trim();
                            if !body.is_empty() {
                                return Some(body.to_string());
                            }
                        }
                    }
                    if let Some(graph) = map.get("@graph") {
                        queue.push_back(graph);
                    }
                    if let Some(main) = map.get("mainEntity") {
                        queue.push_back(main);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// `datePublished` then `dateModified` from the first article-typed object,
/// same breadth-first walk as the body search.
fn jsonld_dates(document: &Html) -> Vec<String> {
    let mut out = Vec::new();
    for block in jsonld_blocks(document) {
        let mut queue: VecDeque<&Value> = VecDeque::from([&block]);
        while let Some(v) = queue.pop_front() {
            match v {
                Value::Array(arr) => queue.extend(arr.iter()),
                Value::Object(map) => {
                    if is_article_type(map.get("@type")) {
                        for key in ["datePublished", "dateModified"] {
                            if let Some(raw) = map.get(key).and_then(|x| x.as_str()) {
                                let raw = clean(raw);
                                if !raw.is_empty() {
                                    out.push(raw);
                                }
                            }
                        }
                        if !out.is_empty() {
                            return out;
                        }
                    }
                    if let Some(graph) = map.get("@graph") {
                        queue.push_back(graph);
                    }
                    if let Some(main) = map.get("mainEntity") {
                        queue.push_back(main);
                    }
                }
                _ => {}
            }
        }
    }
    out
}

fn is_article_type(t: Option<&Value>) -> bool {
    match t {
        Some(Value::String(s)) => ARTICLE_TYPES.contains(&s.as_str()),
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(|x| x.as_str())
            .any(|s| ARTICLE_TYPES.contains(&s)),
        _ => false,
    }
}
