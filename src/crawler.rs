//! Headless-browser discovery of article links from a paginated index page.
//!
//! The release index renders its list client-side and extends it through a
//! "load more" control, so plain HTTP fetching sees a handful of links at
//! best. This crawler drives a real Chrome session via `chromiumoxide`:
//! harvest the anchors matching the article-link pattern, click whatever
//! passes for "load more" on this particular page, wait for the list to
//! grow, repeat.
//!
//! # Termination
//!
//! Every session stops on the first of: target link count reached, round
//! budget exhausted, no clickable control found, or a stall streak
//! (consecutive rounds adding zero links, meaning the control is clickable
//! but inert). Errors inside a click round terminate early with partial
//! results; only launch and initial navigation failures propagate.

use crate::config::CrawlConfig;
use crate::models::LinkCandidate;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::error::Error;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

pub struct PaginationCrawler {
    config: CrawlConfig,
    link_re: Regex,
}

/// One anchor as reported by the in-page harvest script.
#[derive(Debug, Deserialize)]
struct HarvestedLink {
    url: String,
    #[serde(default)]
    title: String,
}

/// Why a crawl session stopped (other than an in-round error).
#[derive(Debug, PartialEq, Eq)]
enum StopReason {
    TargetReached,
    Stalled,
    RoundBudgetExhausted,
}

/// Pure stop check, evaluated between rounds. Stall beats the round budget
/// so logs name the real cause when both trip at once.
fn should_stop(
    collected: usize,
    target: usize,
    rounds_done: usize,
    max_rounds: usize,
    stall_streak: usize,
    stall_limit: usize,
) -> Option<StopReason> {
    if collected >= target {
        return Some(StopReason::TargetReached);
    }
    if stall_streak >= stall_limit {
        return Some(StopReason::Stalled);
    }
    if rounds_done >= max_rounds {
        return Some(StopReason::RoundBudgetExhausted);
    }
    None
}

impl PaginationCrawler {
    /// Build a crawler; fails only on an invalid article-link pattern in
    /// config.
    pub fn new(config: CrawlConfig) -> Result<Self, Box<dyn Error>> {
        let link_re = Regex::new(&config.article_link_pattern)?;
        Ok(Self { config, link_re })
    }

    /// Run one crawl session against the configured start URL and return up
    /// to the clamped target count of deduplicated article links.
    #[instrument(level = "info", skip_all, fields(start_url = %self.config.start_url))]
    pub async fn collect_links(&self) -> Result<Vec<LinkCandidate>, Box<dyn Error>> {
        let target = self.config.clamped_target();
        let max_rounds = self.config.clamped_rounds();
        info!(target, max_rounds, "Starting crawl session");

        let browser_config = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .build()?;

        let (browser, mut handler) = Browser::launch(browser_config).await?;
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser.new_page(self.config.start_url.as_str()).await?;
        page.wait_for_navigation().await?;
        tokio::time::sleep(self.config.settle_delay()).await;

        let mut seen: HashSet<String> = HashSet::new();
        let mut links: Vec<LinkCandidate> = Vec::new();
        let mut stall_streak = 0usize;
        let mut rounds = 0usize;

        // The first harvest runs before any clicking; a page that cannot
        // even be scanned is a failed session, not a partial one.
        let harvested: Vec<HarvestedLink> = page
            .evaluate(self.harvest_script())
            .await?
            .into_value()?;
        self.absorb(harvested, &mut seen, &mut links, target);
        info!(count = links.len(), "Initial harvest");

        loop {
            if let Some(reason) = should_stop(
                links.len(),
                target,
                rounds,
                max_rounds,
                stall_streak,
                self.config.stall_rounds,
            ) {
                info!(?reason, count = links.len(), rounds, "Crawl session done");
                break;
            }

            rounds += 1;
            match self.click_round(&page).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(count = links.len(), rounds, "No load-more control found; stopping");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, count = links.len(), rounds, "Click round failed; keeping partial results");
                    break;
                }
            }

            match self.harvest(&page, &mut seen, &mut links, target).await {
                Ok(added) => {
                    debug!(added, total = links.len(), rounds, "Round harvest");
                    if added == 0 {
                        stall_streak += 1;
                    } else {
                        stall_streak = 0;
                    }
                }
                Err(e) => {
                    warn!(error = %e, count = links.len(), rounds, "Harvest failed; keeping partial results");
                    break;
                }
            }
        }

        drop(page);
        drop(browser);
        Ok(links)
    }

    async fn harvest(
        &self,
        page: &Page,
        seen: &mut HashSet<String>,
        links: &mut Vec<LinkCandidate>,
        target: usize,
    ) -> Result<usize, Box<dyn Error>> {
        let harvested: Vec<HarvestedLink> = page
            .evaluate(self.harvest_script())
            .await?
            .into_value()?;
        Ok(self.absorb(harvested, seen, links, target))
    }

    /// Fold harvested anchors into the running link list: pattern-filtered,
    /// deduplicated against the seen-set, capped at the target.
    fn absorb(
        &self,
        harvested: Vec<HarvestedLink>,
        seen: &mut HashSet<String>,
        links: &mut Vec<LinkCandidate>,
        target: usize,
    ) -> usize {
        let mut added = 0;
        for item in harvested {
            if links.len() >= target {
                break;
            }
            if item.url.is_empty() || !self.link_re.is_match(&item.url) {
                continue;
            }
            if !seen.insert(item.url.clone()) {
                continue;
            }
            let title = if item.title.is_empty() {
                item.url.clone()
            } else {
                item.title
            };
            links.push(LinkCandidate::new(item.url, title));
            added += 1;
        }
        added
    }

    /// One "load more" interaction: scroll down, click the first control the
    /// cascade finds, then wait for the matching-anchor count to grow.
    /// Returns `false` when no control exists on the page.
    async fn click_round(&self, page: &Page) -> Result<bool, Box<dyn Error>> {
        page.evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await?;

        let before = self.matching_anchor_count(page).await?;

        let clicked: Option<String> = page
            .evaluate(self.click_script())
            .await?
            .into_value()?;
        let Some(how) = clicked else {
            return Ok(false);
        };
        debug!(control = %how, "Clicked pagination control");

        tokio::time::sleep(self.config.settle_delay()).await;
        self.wait_for_growth(page, before).await;
        Ok(true)
    }

    /// Poll until more matching anchors exist than before the click, or the
    /// growth timeout passes. Best-effort by design: a timeout just means
    /// the next harvest finds nothing new and the stall counter does its
    /// job.
    async fn wait_for_growth(&self, page: &Page, before: usize) {
        let deadline = Instant::now() + self.config.growth_timeout();
        while Instant::now() < deadline {
            match self.matching_anchor_count(page).await {
                Ok(count) if count > before => {
                    debug!(before, count, "New content arrived");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Anchor count poll failed");
                    return;
                }
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
        debug!(before, "Growth wait timed out");
    }

    async fn matching_anchor_count(&self, page: &Page) -> Result<usize, Box<dyn Error>> {
        let count: usize = page
            .evaluate(self.count_script())
            .await?
            .into_value()?;
        Ok(count)
    }

    // ----- IN-PAGE SCRIPTS -----
    //
    // All three scripts are IIFEs returning JSON-serializable values. The
    // link pattern is embedded as a JSON string literal, which is also a
    // valid JavaScript string literal.

    fn pattern_literal(&self) -> String {
        serde_json::to_string(&self.config.article_link_pattern)
            .unwrap_or_else(|_| "\"\"".to_string())
    }

    fn harvest_script(&self) -> String {
        format!(
            r#"
            (() => {{
                const pattern = new RegExp({pattern});
                const seen = new Set();
                const out = [];
                for (const a of document.querySelectorAll('a[href]')) {{
                    const href = a.href;
                    if (!href || !pattern.test(href)) continue;
                    if (seen.has(href)) continue;
                    seen.add(href);
                    out.push({{ url: href, title: (a.textContent || '').trim().replace(/\s+/g, ' ') }});
                }}
                return out;
            }})()
            "#,
            pattern = self.pattern_literal()
        )
    }

    fn count_script(&self) -> String {
        format!(
            r#"
            (() => {{
                const pattern = new RegExp({pattern});
                let n = 0;
                for (const a of document.querySelectorAll('a[href]')) {{
                    if (a.href && pattern.test(a.href)) n++;
                }}
                return n;
            }})()
            "#,
            pattern = self.pattern_literal()
        )
    }

    /// The control cascade: explicit selectors, class/id substrings, button
    /// text, then generic next-pagination links. Returns a tag naming what
    /// was clicked, or null.
    fn click_script(&self) -> String {
        let quote_list = |items: &[String]| {
            items
                .iter()
                .map(|s| serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()))
                .collect::<Vec<_>>()
                .join(", ")
        };

        format!(
            r#"
            (() => {{
                const explicit = [{explicit}];
                for (const sel of explicit) {{
                    const el = document.querySelector(sel);
                    if (el && !el.disabled) {{ el.click(); return 'selector:' + sel; }}
                }}
                const subs = [{subs}];
                for (const el of document.querySelectorAll('button, a')) {{
                    const cls = ((el.className || '') + ' ' + (el.id || '')).toLowerCase();
                    if (subs.some(s => cls.includes(s))) {{ el.click(); return 'substring:' + cls.trim(); }}
                }}
                const texts = [{texts}];
                for (const el of document.querySelectorAll('button, a')) {{
                    const t = (el.textContent || '').trim().toLowerCase();
                    if (texts.some(x => t.includes(x))) {{ el.click(); return 'text:' + t; }}
                }}
                const next = [{next}];
                for (const sel of next) {{
                    const el = document.querySelector(sel);
                    if (el) {{ el.click(); return 'next:' + sel; }}
                }}
                return null;
            }})()
            "#,
            explicit = quote_list(&self.config.load_more_selectors),
            subs = quote_list(&self.config.load_more_substrings),
            texts = quote_list(&self.config.load_more_texts),
            next = quote_list(&self.config.next_selectors),
        )
    }
}
