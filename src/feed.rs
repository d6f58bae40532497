//! RSS feed discovery: the browserless alternative to the pagination
//! crawler.
//!
//! The site publishes a standard RSS 2.0 feed whose items carry more than
//! the index page does: a description, often an enclosure or
//! `media:content` image, and a `pubDate`. Those ride along on the
//! `LinkCandidate` as hints so downstream stages have a fallback when page
//! extraction comes up empty.
//!
//! Parsing is event-driven and deliberately forgiving: an item missing its
//! link is dropped, unknown elements are skipped, and a hard XML error ends
//! the scan with whatever was collected up to that point.

use crate::fetch::PageFetch;
use crate::models::LinkCandidate;
use once_cell::sync::Lazy;
use quick_xml::escape::unescape;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::error::Error;
use tracing::{info, instrument, warn};

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Which item child element the cursor is currently inside.
#[derive(Clone, Copy, PartialEq)]
enum Field {
    Title,
    Link,
    Description,
    PubDate,
}

#[derive(Default)]
struct ItemFields {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    pub_date: Option<String>,
    image: Option<String>,
}

impl ItemFields {
    fn into_candidate(self) -> Option<LinkCandidate> {
        let link = self.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty())?;
        let title = self
            .title
            .map(|t| collapse_whitespace(&t))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| link.clone());

        let mut candidate = LinkCandidate::new(link, title);
        candidate.summary_hint = self
            .description
            .map(|d| strip_markup(&d))
            .filter(|s| !s.is_empty());
        candidate.image_hint = self.image.filter(|i| !i.is_empty());
        candidate.published_hint = self
            .pub_date
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        Some(candidate)
    }
}

/// Fetch the feed and return up to `limit` article candidates.
#[instrument(level = "info", skip_all, fields(feed_url = %feed_url))]
pub async fn collect_links<F: PageFetch>(
    fetcher: &F,
    feed_url: &str,
    limit: usize,
) -> Result<Vec<LinkCandidate>, Box<dyn Error + Send + Sync>> {
    let xml = fetcher.fetch(feed_url).await?;
    let links = parse_feed(&xml, limit);
    info!(count = links.len(), "Feed discovery complete");
    Ok(links)
}

/// Parse RSS 2.0 markup into link candidates. Total: malformed input yields
/// however many complete items preceded the damage.
pub fn parse_feed(xml: &str, limit: usize) -> Vec<LinkCandidate> {
    let mut out: Vec<LinkCandidate> = Vec::new();
    if limit == 0 {
        return out;
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut in_item = false;
    let mut field: Option<Field> = None;
    let mut item = ItemFields::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"item" => {
                    in_item = true;
                    field = None;
                    item = ItemFields::default();
                }
                b"title" if in_item => field = Some(Field::Title),
                b"link" if in_item => field = Some(Field::Link),
                b"description" if in_item => field = Some(Field::Description),
                b"pubDate" if in_item => field = Some(Field::PubDate),
                b"enclosure" | b"media:content" if in_item => {
                    capture_url_attr(&e, &mut item);
                }
                _ => {}
            },
            // Enclosure and media:content are conventionally self-closing.
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"enclosure" | b"media:content" if in_item => {
                    capture_url_attr(&e, &mut item);
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if in_item && field.is_some() {
                    // Decode bytes first, then resolve entities; either step
                    // failing falls back to the rawest readable form.
                    let text = match t.decode() {
                        Ok(decoded) => match unescape(&decoded) {
                            Ok(unescaped) => unescaped.into_owned(),
                            Err(_) => decoded.into_owned(),
                        },
                        Err(_) => String::from_utf8_lossy(&t).into_owned(),
                    };
                    append_field(&mut item, field, &text);
                }
            }
            Ok(Event::CData(t)) => {
                if in_item && field.is_some() {
                    let text = String::from_utf8_lossy(&t).into_owned();
                    append_field(&mut item, field, &text);
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"item" => {
                    in_item = false;
                    field = None;
                    if let Some(candidate) = std::mem::take(&mut item).into_candidate() {
                        out.push(candidate);
                        if out.len() >= limit {
                            break;
                        }
                    }
                }
                b"title" | b"link" | b"description" | b"pubDate" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!(error = %e, collected = out.len(), "Feed markup error; stopping scan");
                break;
            }
            _ => {}
        }
    }

    out
}

fn capture_url_attr(e: &quick_xml::events::BytesStart<'_>, item: &mut ItemFields) {
    if item.image.is_some() {
        return;
    }
    if let Some(attr) = e.try_get_attribute("url").ok().flatten() {
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
        if !value.is_empty() {
            item.image = Some(value);
        }
    }
}

fn append_field(item: &mut ItemFields, field: Option<Field>, text: &str) {
    if text.is_empty() {
        return;
    }
    let slot = match field {
        Some(Field::Title) => &mut item.title,
        Some(Field::Link) => &mut item.link,
        Some(Field::Description) => &mut item.description,
        Some(Field::PubDate) => &mut item.pub_date,
        None => return,
    };
    match slot {
        Some(existing) => existing.push_str(text),
        None => *slot = Some(text.to_string()),
    }
}

/// Feed descriptions arrive as HTML fragments; the summary hint wants plain
/// text.
fn strip_markup(html: &str) -> String {
    collapse_whitespace(&TAG_RE.replace_all(html, " "))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
