//! Data models for discovered links and normalized article records.
//!
//! This module defines the core data structures flowing through the pipeline:
//! - [`LinkCandidate`]: A release URL discovered by the crawler or feed reader
//! - [`ExtractionResult`]: Best-effort fields pulled out of one release page
//! - [`ArticleRecord`]: The normalized output unit persisted to the dataset
//!
//! Records are keyed by a deterministic `id` derived from the source URL, so
//! re-running the pipeline against the same releases upserts rather than
//! duplicates.

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// BC release URLs embed the publishing ministry as an uppercase acronym:
/// `.../releases/2024AG0012-000345` -> `AG`.
static MINISTRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"releases/\d+([A-Z]{2,5})\d+-").unwrap());

/// A release link discovered during a single scrape session.
///
/// Created by the pagination crawler (or the RSS feed reader), consumed
/// exactly once by the fetch orchestrator, and discarded after the record
/// for it has been assembled.
///
/// The three `*_hint` fields are only populated by the feed reader, which
/// gets a summary, an enclosure image, and a publication date for free from
/// the feed XML. The crawler leaves them `None`; the orchestrator treats
/// them as last-resort fallbacks behind anything extracted from the page
/// itself.
#[derive(Debug, Clone)]
pub struct LinkCandidate {
    /// Absolute URL of the release page.
    pub url: String,
    /// Title as shown on the index page or feed; used when the page itself
    /// yields no better title.
    pub fallback_title: String,
    /// Feed-provided summary, if any.
    pub summary_hint: Option<String>,
    /// Feed-provided image URL, if any.
    pub image_hint: Option<String>,
    /// Feed-provided publication date string, if any. Passed to the date
    /// normalizer untouched.
    pub published_hint: Option<String>,
}

impl LinkCandidate {
    /// Candidate with only a URL and display title, as produced by the
    /// pagination crawler.
    pub fn new(url: impl Into<String>, fallback_title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fallback_title: fallback_title.into(),
            summary_hint: None,
            image_hint: None,
            published_hint: None,
        }
    }
}

/// Best-effort fields extracted from one release page.
///
/// Every field is independently best-effort: extraction never fails, it just
/// leaves fields empty. Date strings are collected raw (in priority order)
/// and handed to the date normalizer; image resolution happens later in the
/// hero image resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub title: String,
    pub description: String,
    pub body_text: String,
    /// Direct image URL with a recognized image extension, if one was found.
    pub image_url: Option<String>,
    /// An image-handler URL (serves or redirects to an image rather than
    /// being one) seen while scanning, kept for the resolver to chase when
    /// no direct image turned up.
    pub handler_url: Option<String>,
    /// Raw date strings in priority order (structured data first, labelled
    /// text last). Not parsed here.
    pub date_candidates: Vec<String>,
}

/// A normalized article record, the pipeline's output unit.
///
/// `hero_image` and `published_at` are `Option` on purpose: a release with
/// no resolvable image or date is still a valid record, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleRecord {
    /// Deterministic id derived from `source_url`; see [`article_id`].
    pub id: String,
    pub title: String,
    pub summary: String,
    pub body: String,
    pub source_url: String,
    /// Ministry acronym parsed from the release URL, when present.
    pub ministry: Option<String>,
    pub hero_image: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl ArticleRecord {
    /// Extract the ministry acronym from a release URL.
    pub fn ministry_of(url: &str) -> Option<String> {
        MINISTRY_RE
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

/// Derive the stable record id for a source URL.
///
/// Standard base64 of the URL bytes with the trailing `=` padding dropped.
/// The same URL always produces the same id, which is what makes merge-mode
/// re-ingestion an upsert instead of an append.
pub fn article_id(source_url: &str) -> String {
    STANDARD_NO_PAD.encode(source_url.as_bytes())
}
