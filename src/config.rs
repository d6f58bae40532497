//! Runtime configuration for the harvest pipeline.
//!
//! Every tunable the pipeline consults lives here with a working default, so
//! the binary runs with no config file at all. An optional YAML file
//! (`--config`) overrides any subset of fields; CLI flags override the file.
//!
//! The selector cascades and URL patterns default to what the BC Gov News
//! site needs, but nothing in the pipeline is hardwired to that site: point
//! `crawl.start_url` and the patterns elsewhere and the same binary crawls a
//! differently shaped release index.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::time::Duration;
use tracing::info;

/// Hard ceiling on links requested per run, regardless of config or CLI.
pub const MAX_TARGET_COUNT: usize = 200;
/// Hard ceiling on "load more" rounds per crawl session.
pub const MAX_CRAWL_ROUNDS: usize = 40;
/// Hard ceiling on orchestrator worker tasks.
pub const MAX_CONCURRENCY: usize = 16;

/// Top-level pipeline configuration, one section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub crawl: CrawlConfig,
    pub extract: ExtractConfig,
    pub images: ImageConfig,
    pub fetch: FetchConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file, falling back to defaults for any
    /// field the file omits.
    pub fn load(path: &str) -> Result<Self, Box<dyn Error>> {
        let raw = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&raw)?;
        info!(path, "Loaded pipeline configuration");
        Ok(config)
    }
}

/// Settings for the headless-browser pagination crawler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Index page the crawl session starts from.
    pub start_url: String,

    /// How many article links to collect before stopping (clamped to
    /// [`MAX_TARGET_COUNT`]).
    pub target_count: usize,

    /// Maximum "load more" rounds per session (clamped to
    /// [`MAX_CRAWL_ROUNDS`]).
    pub max_rounds: usize,

    /// Consecutive zero-new-link rounds before the crawler gives up.
    pub stall_rounds: usize,

    /// Fixed delay after each click before re-harvesting, in milliseconds.
    pub settle_delay_ms: u64,

    /// How long to poll for the anchor count to grow after a click, in
    /// milliseconds.
    pub growth_timeout_ms: u64,

    /// Poll interval while waiting for growth, in milliseconds.
    pub poll_interval_ms: u64,

    /// Substring-or-regex an anchor href must match to count as an article
    /// link. Embedded verbatim in the in-page harvest script, so it must be
    /// valid JavaScript RegExp syntax too (no inline flags).
    pub article_link_pattern: String,

    /// Explicit "load more" control selectors, tried first.
    pub load_more_selectors: Vec<String>,

    /// Class/id substrings that mark a control as a "load more" button.
    pub load_more_substrings: Vec<String>,

    /// Button/link text (lowercased) that marks a "load more" control.
    pub load_more_texts: Vec<String>,

    /// Generic next-page fallbacks when no "load more" control exists.
    pub next_selectors: Vec<String>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            start_url: "https://news.gov.bc.ca/releases".to_string(),
            target_count: 40,
            max_rounds: 12,
            stall_rounds: 3,
            settle_delay_ms: 1200,
            growth_timeout_ms: 8000,
            poll_interval_ms: 250,
            article_link_pattern: r"/releases/\d".to_string(),
            load_more_selectors: vec![
                "button.load-more".to_string(),
                "a.load-more".to_string(),
                "#loadMoreButton".to_string(),
                ".btn-load-more".to_string(),
            ],
            load_more_substrings: vec![
                "load-more".to_string(),
                "loadmore".to_string(),
                "show-more".to_string(),
            ],
            load_more_texts: vec![
                "load more".to_string(),
                "show more".to_string(),
                "more news".to_string(),
            ],
            next_selectors: vec!["a[rel=next]".to_string(), ".pagination .next a".to_string()],
        }
    }
}

impl CrawlConfig {
    pub fn clamped_target(&self) -> usize {
        self.target_count.min(MAX_TARGET_COUNT)
    }

    pub fn clamped_rounds(&self) -> usize {
        self.max_rounds.min(MAX_CRAWL_ROUNDS)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn growth_timeout(&self) -> Duration {
        Duration::from_millis(self.growth_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Settings for the HTML content extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Content-container selectors, in priority order.
    pub content_selectors: Vec<String>,

    /// Page-heading selectors tried after `og:title`/`twitter:title`/`h1`.
    pub heading_selectors: Vec<String>,

    /// Selectors for date-labelled text regions.
    pub date_text_selectors: Vec<String>,

    /// Bodies shorter than this fall through to the next strategy.
    pub min_body_length: usize,

    /// Bodies are capped at this many characters.
    pub max_body_length: usize,

    /// Site-wide `<p>` elements collected by the last-resort body strategy.
    pub max_fallback_paragraphs: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            content_selectors: vec![
                ".article-content".to_string(),
                ".news-release-body".to_string(),
                "#releaseBody".to_string(),
                "article".to_string(),
                "[role=\"main\"]".to_string(),
                "main".to_string(),
                ".entry-content".to_string(),
                ".body-content".to_string(),
                "#content".to_string(),
                ".content".to_string(),
            ],
            heading_selectors: vec![
                "h1.article-title".to_string(),
                ".page-title h1".to_string(),
                "h2.title".to_string(),
            ],
            date_text_selectors: vec![
                ".article-date".to_string(),
                ".date-posted".to_string(),
                "[class*=\"date\"]".to_string(),
                "time".to_string(),
            ],
            min_body_length: 200,
            max_body_length: 20_000,
            max_fallback_paragraphs: 12,
        }
    }
}

/// Settings for the hero image resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Regex marking a URL as a handler-redirector endpoint rather than a
    /// direct image. The default matches the ASP.NET path convention
    /// government sites tend to use; override it per target site.
    pub handler_pattern: String,

    /// Image search API base (Unsplash-shaped `/search/photos` endpoint).
    pub search_api_base: String,

    /// Keyword-redirect fallback base.
    pub fallback_base: String,

    /// Host the keyword redirect must land on to be trusted.
    pub expected_cdn_host: String,

    /// Last-resort image path, always valid for the consuming frontend.
    pub placeholder: String,

    /// Fixed qualifier appended to every derived search query.
    pub regional_qualifier: String,

    /// Title words kept in a derived query, after stop-word removal.
    pub max_query_words: usize,

    /// Lowercased words stripped from titles before querying.
    pub stop_words: Vec<String>,

    /// Timeout for resolver HTTP calls, in seconds.
    pub timeout_secs: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            handler_pattern: r"(?i)\.ashx(?:$|\?)|/(?:image|media)handler".to_string(),
            search_api_base: "https://api.unsplash.com".to_string(),
            fallback_base: "https://source.unsplash.com".to_string(),
            expected_cdn_host: "images.unsplash.com".to_string(),
            placeholder: "/images/placeholder.jpg".to_string(),
            regional_qualifier: "British Columbia".to_string(),
            max_query_words: 3,
            stop_words: [
                "province",
                "provincial",
                "government",
                "ministry",
                "minister",
                "premier",
                "bc",
                "british",
                "columbia",
                "news",
                "release",
                "statement",
                "announces",
                "announcement",
                "announced",
                "new",
                "public",
                "the",
                "a",
                "an",
                "of",
                "for",
                "and",
                "to",
                "in",
                "on",
                "with",
                "at",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeout_secs: 10,
        }
    }
}

impl ImageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings for article-page HTTP fetching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,

    /// Retry attempts before a fetch is reported failed.
    pub max_retries: usize,

    /// Initial backoff delay in milliseconds (doubles per attempt).
    pub base_delay_ms: u64,

    /// Upper bound on the jittered delay inserted between items by each
    /// orchestrator worker, in milliseconds.
    pub item_delay_jitter_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_retries: 3,
            base_delay_ms: 500,
            item_delay_jitter_ms: 400,
        }
    }
}

impl FetchConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_crawl_values() {
        let config = CrawlConfig::default();
        assert_eq!(config.start_url, "https://news.gov.bc.ca/releases");
        assert_eq!(config.target_count, 40);
        assert_eq!(config.max_rounds, 12);
        assert_eq!(config.stall_rounds, 3);
        assert!(!config.load_more_selectors.is_empty());
        assert!(!config.load_more_texts.is_empty());
        assert_eq!(config.settle_delay(), Duration::from_millis(1200));
    }

    #[test]
    fn test_clamps_apply_ceilings() {
        let config = CrawlConfig {
            target_count: 5000,
            max_rounds: 999,
            ..Default::default()
        };
        assert_eq!(config.clamped_target(), MAX_TARGET_COUNT);
        assert_eq!(config.clamped_rounds(), MAX_CRAWL_ROUNDS);

        let modest = CrawlConfig {
            target_count: 10,
            max_rounds: 2,
            ..Default::default()
        };
        assert_eq!(modest.clamped_target(), 10);
        assert_eq!(modest.clamped_rounds(), 2);
    }

    #[test]
    fn test_default_extract_thresholds() {
        let config = ExtractConfig::default();
        assert_eq!(config.min_body_length, 200);
        assert_eq!(config.max_body_length, 20_000);
        assert_eq!(config.max_fallback_paragraphs, 12);
        assert_eq!(config.content_selectors[0], ".article-content");
    }

    #[test]
    fn test_default_image_endpoints() {
        let config = ImageConfig::default();
        assert_eq!(config.search_api_base, "https://api.unsplash.com");
        assert_eq!(config.fallback_base, "https://source.unsplash.com");
        assert_eq!(config.expected_cdn_host, "images.unsplash.com");
        assert_eq!(config.placeholder, "/images/placeholder.jpg");
        assert_eq!(config.regional_qualifier, "British Columbia");
        assert!(config.stop_words.iter().any(|w| w == "ministry"));
    }

    #[test]
    fn test_partial_yaml_overrides_only_named_fields() {
        let yaml = r#"
crawl:
  target_count: 12
images:
  placeholder: "/img/none.png"
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.crawl.target_count, 12);
        assert_eq!(config.images.placeholder, "/img/none.png");
        // Everything unnamed keeps its default.
        assert_eq!(config.crawl.max_rounds, 12);
        assert_eq!(config.fetch.timeout_secs, 20);
        assert_eq!(config.images.regional_qualifier, "British Columbia");
    }

    #[test]
    fn test_empty_yaml_is_all_defaults() {
        let config: PipelineConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.crawl.target_count, CrawlConfig::default().target_count);
        assert_eq!(config.extract.min_body_length, 200);
    }

    #[test]
    fn test_handler_pattern_compiles_and_matches() {
        let config = ImageConfig::default();
        let re = regex::Regex::new(&config.handler_pattern).unwrap();
        assert!(re.is_match("https://news.gov.bc.ca/ImageHandler.ashx?id=44"));
        assert!(re.is_match("https://example.org/imagehandler/2024/photo"));
        assert!(!re.is_match("https://example.org/files/photo.jpg"));
    }
}
