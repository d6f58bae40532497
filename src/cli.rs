//! Command-line interface definitions for the harvester.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Most options can also come from the YAML config file; flags given here
//! win over config values.

use clap::{Parser, ValueEnum};

/// Where article links are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Source {
    /// Drive the release index page in a headless browser.
    #[default]
    Index,
    /// Read the site's RSS feed (no browser needed).
    Feed,
}

/// Command-line arguments for the BC news harvester.
///
/// # Examples
///
/// ```sh
/// # Crawl the release index and write a fresh dataset
/// bc_news_harvest -o ./data
///
/// # Feed-based discovery, merged into the existing dataset
/// bc_news_harvest -o ./data --source feed --merge
///
/// # Cap the run and raise concurrency
/// bc_news_harvest -o ./data --count 25 --concurrency 8
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Output directory for the dataset JSON file
    #[arg(short, long)]
    pub output_dir: String,

    /// Release index page to start crawling from
    #[arg(long)]
    pub start_url: Option<String>,

    /// How many articles to collect
    #[arg(long)]
    pub count: Option<usize>,

    /// Concurrent page fetches during the article phase
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Maximum load-more rounds per crawl session
    #[arg(long)]
    pub max_rounds: Option<usize>,

    /// Discovery source for article links
    #[arg(long, value_enum, default_value_t = Source::Index)]
    pub source: Source,

    /// RSS feed URL (used with --source feed)
    #[arg(long, default_value = "https://news.gov.bc.ca/feed")]
    pub feed_url: String,

    /// Merge into the existing dataset instead of replacing it
    #[arg(long)]
    pub merge: bool,

    /// Optional path to config.yaml file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Unsplash API access key for hero image search
    #[arg(long, env = "UNSPLASH_ACCESS_KEY")]
    pub unsplash_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(&["bc_news_harvest", "--output-dir", "./data"]);

        assert_eq!(cli.output_dir, "./data");
        assert_eq!(cli.source, Source::Index);
        assert_eq!(cli.feed_url, "https://news.gov.bc.ca/feed");
        assert_eq!(cli.concurrency, 4);
        assert!(!cli.merge);
        assert!(cli.count.is_none());
        assert!(cli.start_url.is_none());
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::parse_from(&["bc_news_harvest", "-o", "/tmp/data", "-c", "conf.yaml"]);

        assert_eq!(cli.output_dir, "/tmp/data");
        assert_eq!(cli.config.as_deref(), Some("conf.yaml"));
    }

    #[test]
    fn test_cli_full_invocation() {
        let cli = Cli::parse_from(&[
            "bc_news_harvest",
            "-o",
            "./out",
            "--start-url",
            "https://news.gov.bc.ca/releases",
            "--count",
            "25",
            "--concurrency",
            "8",
            "--max-rounds",
            "6",
            "--source",
            "feed",
            "--feed-url",
            "https://example.com/feed",
            "--merge",
            "--unsplash-key",
            "abc123",
        ]);

        assert_eq!(
            cli.start_url.as_deref(),
            Some("https://news.gov.bc.ca/releases")
        );
        assert_eq!(cli.count, Some(25));
        assert_eq!(cli.concurrency, 8);
        assert_eq!(cli.max_rounds, Some(6));
        assert_eq!(cli.source, Source::Feed);
        assert_eq!(cli.feed_url, "https://example.com/feed");
        assert!(cli.merge);
        assert_eq!(cli.unsplash_key.as_deref(), Some("abc123"));
    }
}
