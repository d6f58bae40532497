//! Fan-out stage: turns discovered links into finished article records.
//!
//! # Worker model
//!
//! `process` spawns a small pool of tokio workers that share a single
//! atomic cursor into the link slice. Each worker claims the next unclaimed
//! index, fetches and assembles that one record, and repeats until the
//! cursor runs past the end. The cursor guarantees every index is claimed
//! at most once; fan-in fills any index that never came back (a panicked
//! worker takes its in-flight claims with it) with a degraded record, so
//! the output always holds exactly one record per input link.
//!
//! # Failure isolation
//!
//! A fetch failure degrades that one item: the record keeps the fallback
//! title and whatever feed hints rode along, with an empty body and a
//! resolver-derived image from the title alone. Nothing an item does can
//! abort its siblings.

use crate::config::{FetchConfig, MAX_CONCURRENCY};
use crate::dates;
use crate::extract::Extractor;
use crate::fetch::PageFetch;
use crate::images::HeroImageResolver;
use crate::models::{article_id, ArticleRecord, ExtractionResult, LinkCandidate};
use crate::utils::truncate_for_log;
use rand::{rng, Rng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub struct Orchestrator<F> {
    fetcher: Arc<F>,
    extractor: Arc<Extractor>,
    resolver: Arc<HeroImageResolver>,
    item_delay_jitter_ms: u64,
}

/// Pool sizing: never more workers than links, never more than the hard
/// ceiling, never zero.
fn worker_count(requested: usize, links: usize) -> usize {
    requested.clamp(1, MAX_CONCURRENCY).min(links)
}

impl<F> Orchestrator<F>
where
    F: PageFetch + Send + Sync + 'static,
{
    pub fn new(
        fetcher: F,
        extractor: Extractor,
        resolver: HeroImageResolver,
        fetch_config: &FetchConfig,
    ) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            extractor: Arc::new(extractor),
            resolver: Arc::new(resolver),
            item_delay_jitter_ms: fetch_config.item_delay_jitter_ms,
        }
    }

    /// Process every link and return one record per link, order
    /// unspecified.
    #[instrument(level = "info", skip_all, fields(links = links.len(), concurrency))]
    pub async fn process(
        &self,
        links: Vec<LinkCandidate>,
        concurrency: usize,
    ) -> Vec<ArticleRecord> {
        if links.is_empty() {
            return Vec::new();
        }

        let links: Arc<[LinkCandidate]> = links.into();
        let cursor = Arc::new(AtomicUsize::new(0));
        let workers = worker_count(concurrency, links.len());
        info!(links = links.len(), workers, "Fetching articles");

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let links = Arc::clone(&links);
            let cursor = Arc::clone(&cursor);
            let fetcher = Arc::clone(&self.fetcher);
            let extractor = Arc::clone(&self.extractor);
            let resolver = Arc::clone(&self.resolver);
            let jitter = self.item_delay_jitter_ms;

            handles.push(tokio::spawn(async move {
                let mut produced: Vec<(usize, ArticleRecord)> = Vec::new();
                loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    if index >= links.len() {
                        break;
                    }
                    if jitter > 0 {
                        let delay = rng().random_range(0..=jitter);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    let record = process_one(
                        fetcher.as_ref(),
                        extractor.as_ref(),
                        resolver.as_ref(),
                        &links[index],
                    )
                    .await;
                    produced.push((index, record));
                }
                debug!(worker, produced = produced.len(), "Worker drained");
                produced
            }));
        }

        let mut slots: Vec<Option<ArticleRecord>> = (0..links.len()).map(|_| None).collect();
        for handle in handles {
            match handle.await {
                Ok(produced) => {
                    for (index, record) in produced {
                        slots[index] = Some(record);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Worker task died; its items will be rebuilt");
                }
            }
        }

        let mut records = Vec::with_capacity(links.len());
        let mut rebuilt = 0usize;
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(record) => records.push(record),
                None => {
                    rebuilt += 1;
                    warn!(url = %links[index].url, "Rebuilding record lost to a dead worker");
                    records.push(degraded_record(self.resolver.as_ref(), &links[index]).await);
                }
            }
        }
        if rebuilt > 0 {
            warn!(rebuilt, "Some records were rebuilt as degraded");
        }
        info!(records = records.len(), "Fetch phase complete");
        records
    }
}

async fn process_one<F: PageFetch>(
    fetcher: &F,
    extractor: &Extractor,
    resolver: &HeroImageResolver,
    link: &LinkCandidate,
) -> ArticleRecord {
    match fetcher.fetch(&link.url).await {
        Ok(html) => {
            let extraction = extractor.extract(&html, &link.url, &link.fallback_title);
            debug!(
                url = %link.url,
                body_preview = %truncate_for_log(&extraction.body_text, 120),
                "Extracted page"
            );
            assemble(resolver, link, extraction).await
        }
        Err(e) => {
            warn!(url = %link.url, error = %e, "Page fetch failed; emitting degraded record");
            degraded_record(resolver, link).await
        }
    }
}

/// Merge extraction output with the link's feed hints into a finished
/// record.
async fn assemble(
    resolver: &HeroImageResolver,
    link: &LinkCandidate,
    extraction: ExtractionResult,
) -> ArticleRecord {
    // Date priority: everything the page said, then the feed's pubDate,
    // then the title as last resort. The extractor already put the title
    // last in its own list, so lift it out before appending the hint.
    let mut candidates: Vec<Option<String>> = extraction
        .date_candidates
        .iter()
        .cloned()
        .map(Some)
        .collect();
    let title_candidate = if extraction.title.is_empty() {
        None
    } else {
        candidates.pop().flatten()
    };
    candidates.push(link.published_hint.clone());
    candidates.push(title_candidate);
    let published_at = dates::normalize(&candidates);

    let image_candidate = extraction
        .image_url
        .as_deref()
        .or(extraction.handler_url.as_deref())
        .or(link.image_hint.as_deref());
    let hero_image = resolver.resolve(&extraction.title, image_candidate).await;

    let summary = if extraction.description.is_empty() {
        link.summary_hint.clone().unwrap_or_default()
    } else {
        extraction.description
    };

    ArticleRecord {
        id: article_id(&link.url),
        title: extraction.title,
        summary,
        body: extraction.body_text,
        source_url: link.url.clone(),
        ministry: ArticleRecord::ministry_of(&link.url),
        hero_image: Some(hero_image),
        published_at,
    }
}

/// The record an item collapses to when its page cannot be fetched.
async fn degraded_record(resolver: &HeroImageResolver, link: &LinkCandidate) -> ArticleRecord {
    let hero_image = resolver.resolve(&link.fallback_title, None).await;
    ArticleRecord {
        id: article_id(&link.url),
        title: link.fallback_title.clone(),
        summary: link.summary_hint.clone().unwrap_or_default(),
        body: String::new(),
        source_url: link.url.clone(),
        ministry: ArticleRecord::ministry_of(&link.url),
        hero_image: Some(hero_image),
        published_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtractConfig, ImageConfig};
    use std::collections::{HashMap, HashSet};
    use std::error::Error;
    use std::sync::Mutex;

    /// Canned-page fetcher. Unknown URLs yield an empty page, listed URLs
    /// fail, and every request lands in the shared log.
    struct ScriptedFetcher {
        pages: HashMap<String, String>,
        fail: HashSet<String>,
        panic_on: Option<String>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedFetcher {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            let fetcher = Self {
                pages: HashMap::new(),
                fail: HashSet::new(),
                panic_on: None,
                log: Arc::clone(&log),
            };
            (fetcher, log)
        }
    }

    impl PageFetch for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.log.lock().unwrap().push(url.to_string());
            if self.panic_on.as_deref() == Some(url) {
                panic!("scripted panic");
            }
            if self.fail.contains(url) {
                return Err("scripted failure".into());
            }
            Ok(self.pages.get(url).cloned().unwrap_or_default())
        }
    }

    /// Resolver aimed at unroutable endpoints so nothing leaves the
    /// process; every network branch fails fast and falls through.
    fn offline_resolver() -> HeroImageResolver {
        let config = ImageConfig {
            search_api_base: "http://127.0.0.1:9".to_string(),
            fallback_base: "http://127.0.0.1:9".to_string(),
            timeout_secs: 1,
            ..ImageConfig::default()
        };
        HeroImageResolver::new(config, None).unwrap()
    }

    fn orchestrator(fetcher: ScriptedFetcher) -> Orchestrator<ScriptedFetcher> {
        let extractor = Extractor::new(
            ExtractConfig::default(),
            &ImageConfig::default().handler_pattern,
        )
        .unwrap();
        let fetch_config = FetchConfig {
            item_delay_jitter_ms: 0,
            ..FetchConfig::default()
        };
        Orchestrator::new(fetcher, extractor, offline_resolver(), &fetch_config)
    }

    fn release_url(n: usize) -> String {
        format!("https://news.gov.bc.ca/releases/2024AG00{n:02}-0003{n:02}")
    }

    fn links(n: usize) -> Vec<LinkCandidate> {
        (0..n)
            .map(|i| LinkCandidate::new(release_url(i), format!("Release {i}")))
            .collect()
    }

    fn page_with_image(title: &str) -> String {
        format!(
            r#"<html><head>
            <meta property="og:title" content="{title}">
            <meta name="description" content="Summary of {title}.">
            <meta property="og:image" content="https://news.gov.bc.ca/files/{title}.jpg">
            </head><body><p>Body text.</p></body></html>"#
        )
    }

    #[test]
    fn test_worker_count_sizing() {
        assert_eq!(worker_count(4, 100), 4);
        assert_eq!(worker_count(0, 5), 1);
        assert_eq!(worker_count(99, 100), MAX_CONCURRENCY);
        assert_eq!(worker_count(8, 3), 3);
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_output() {
        let (fetcher, _) = ScriptedFetcher::new();
        let records = orchestrator(fetcher).process(Vec::new(), 4).await;
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_one_record_per_link_with_failures() {
        let mut input = links(5);
        input[2].summary_hint = Some("Hint for the broken one".to_string());

        let (mut fetcher, _) = ScriptedFetcher::new();
        for (i, link) in input.iter().enumerate() {
            fetcher
                .pages
                .insert(link.url.clone(), page_with_image(&format!("item{i}")));
        }
        fetcher.fail.insert(input[2].url.clone());

        let records = orchestrator(fetcher).process(input.clone(), 3).await;
        assert_eq!(records.len(), 5);

        let mut got: Vec<&str> = records.iter().map(|r| r.source_url.as_str()).collect();
        got.sort_unstable();
        let mut want: Vec<&str> = input.iter().map(|l| l.url.as_str()).collect();
        want.sort_unstable();
        assert_eq!(got, want);

        let degraded = records
            .iter()
            .find(|r| r.source_url == input[2].url)
            .unwrap();
        assert_eq!(degraded.title, "Release 2");
        assert_eq!(degraded.summary, "Hint for the broken one");
        assert!(degraded.body.is_empty());
        assert!(degraded.hero_image.as_deref().is_some_and(|h| !h.is_empty()));
        assert!(degraded.published_at.is_none());
        assert_eq!(degraded.ministry.as_deref(), Some("AG"));

        let healthy = records
            .iter()
            .find(|r| r.source_url == input[0].url)
            .unwrap();
        assert_eq!(healthy.title, "item0");
        assert_eq!(healthy.summary, "Summary of item0.");
        assert_eq!(
            healthy.hero_image.as_deref(),
            Some("https://news.gov.bc.ca/files/item0.jpg")
        );
    }

    #[tokio::test]
    async fn test_cursor_claims_each_url_exactly_once() {
        let input = links(8);
        let (mut fetcher, log) = ScriptedFetcher::new();
        for (i, link) in input.iter().enumerate() {
            fetcher
                .pages
                .insert(link.url.clone(), page_with_image(&format!("item{i}")));
        }

        let records = orchestrator(fetcher).process(input.clone(), 3).await;
        assert_eq!(records.len(), 8);

        let mut fetched = log.lock().unwrap().clone();
        fetched.sort_unstable();
        let mut want: Vec<String> = input.iter().map(|l| l.url.clone()).collect();
        want.sort_unstable();
        assert_eq!(fetched, want);
    }

    #[tokio::test]
    async fn test_summary_hint_fills_empty_extraction() {
        let mut input = links(1);
        input[0].summary_hint = Some("Feed summary".to_string());
        // Enclosure URLs from the feed often carry no file extension.
        input[0].image_hint =
            Some("https://news.gov.bc.ca/assets/release-media/9921".to_string());

        // No page registered: the fetch succeeds with an empty document.
        let (fetcher, _) = ScriptedFetcher::new();
        let records = orchestrator(fetcher).process(input, 1).await;

        assert_eq!(records[0].summary, "Feed summary");
        assert_eq!(records[0].title, "Release 0");
        // With nothing extracted, the feed's enclosure is the candidate and
        // is trusted as-is rather than demoted to keyword search.
        assert_eq!(
            records[0].hero_image.as_deref(),
            Some("https://news.gov.bc.ca/assets/release-media/9921")
        );
    }

    #[tokio::test]
    async fn test_published_hint_used_when_page_is_dateless() {
        let mut input = links(1);
        input[0].published_hint = Some("Tue, 16 Jul 2024 08:00:00 -0700".to_string());

        let (fetcher, _) = ScriptedFetcher::new();
        let records = orchestrator(fetcher).process(input, 1).await;

        let published = records[0].published_at.expect("pubDate hint should parse");
        assert_eq!(published.to_rfc3339(), "2024-07-16T15:00:00+00:00");
    }

    #[tokio::test]
    async fn test_handler_only_page_never_outputs_handler_url() {
        let mut input = links(1);
        input[0].url = "https://news.gov.bc.ca/releases/2024AG0001-000001".to_string();

        let (mut fetcher, _) = ScriptedFetcher::new();
        // The only image on the page is a handler URL; it points at an
        // unroutable host so the chase fails and the chain falls through.
        fetcher.pages.insert(
            input[0].url.clone(),
            r#"<html><head><meta property="og:title" content="Handler page"></head>
            <body><article><p>Text</p>
            <img src="http://127.0.0.1:9/ImageHandler.ashx?id=7">
            </article></body></html>"#
                .to_string(),
        );

        let records = orchestrator(fetcher).process(input, 1).await;
        let hero = records[0].hero_image.as_deref().unwrap();
        assert!(!hero.contains("ImageHandler.ashx"));
        assert!(!hero.is_empty());
    }

    #[tokio::test]
    async fn test_dead_worker_items_are_rebuilt() {
        let input = links(4);
        let (mut fetcher, _) = ScriptedFetcher::new();
        for (i, link) in input.iter().enumerate() {
            fetcher
                .pages
                .insert(link.url.clone(), page_with_image(&format!("item{i}")));
        }
        fetcher.panic_on = Some(input[1].url.clone());

        let records = orchestrator(fetcher).process(input.clone(), 2).await;

        // Still one record per link, and the panicking item came back
        // degraded.
        assert_eq!(records.len(), 4);
        let mut got: Vec<&str> = records.iter().map(|r| r.source_url.as_str()).collect();
        got.sort_unstable();
        let mut want: Vec<&str> = input.iter().map(|l| l.url.as_str()).collect();
        want.sort_unstable();
        assert_eq!(got, want);

        let rebuilt = records
            .iter()
            .find(|r| r.source_url == input[1].url)
            .unwrap();
        assert_eq!(rebuilt.title, "Release 1");
        assert!(rebuilt.body.is_empty());
        // No hints on this link, so the degraded summary is empty too.
        assert!(rebuilt.summary.is_empty());
    }
}
