//! # BC News Harvest
//!
//! A content extraction and normalization pipeline for the British Columbia
//! government news site. It discovers release pages, pulls each one apart
//! with layered fallback cascades, and emits a normalized JSON dataset of
//! article records.
//!
//! ## Features
//!
//! - Discovers release links by driving the paginated index in a headless
//!   browser, or by reading the site's RSS feed
//! - Extracts title, summary, body, date and image per page with
//!   selector-cascade fallbacks (structured data first, scraped text last)
//! - Normalizes publication dates to UTC from several human layouts
//! - Resolves hero images through handler chasing, Unsplash search and a
//!   keyword fallback, ending at a placeholder rather than nothing
//! - Writes a JSON dataset, with optional id-keyed merge into a previous run
//!
//! ## Usage
//!
//! ```sh
//! bc_news_harvest -o ./data
//! ```
//!
//! ## Architecture
//!
//! The application follows a pipeline architecture:
//! 1. **Discovery**: Collect article links from the release index (or feed)
//! 2. **Fetching**: Download each release page through the retrying fetcher
//! 3. **Assembly**: Extract, normalize dates and resolve images per page
//! 4. **Output**: Write or merge the dataset JSON file

use clap::Parser;
use std::error::Error;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

mod cli;
mod config;
mod crawler;
mod dates;
mod extract;
mod feed;
mod fetch;
mod images;
mod models;
mod orchestrator;
mod outputs;
mod utils;

use cli::{Cli, Source};
use config::PipelineConfig;
use crawler::PaginationCrawler;
use extract::Extractor;
use fetch::retrying_fetcher;
use images::HeroImageResolver;
use orchestrator::Orchestrator;
use outputs::json;
use utils::ensure_writable_dir;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("bc_news_harvest starting up");

    // Parse CLI
    let args = Cli::parse();
    debug!(?args.output_dir, ?args.source, "Parsed CLI arguments");

    // ---- Load config, apply CLI overrides ----
    let mut config = match args.config.as_deref() {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(ref start_url) = args.start_url {
        config.crawl.start_url = start_url.clone();
    }
    if let Some(count) = args.count {
        config.crawl.target_count = count;
    }
    if let Some(max_rounds) = args.max_rounds {
        config.crawl.max_rounds = max_rounds;
    }

    // Early check: ensure the output dir is writable before any network work
    if let Err(e) = ensure_writable_dir(&args.output_dir).await {
        error!(
            path = %args.output_dir,
            error = %e,
            "Output directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    // ---- Discover article links ----
    let fetcher = retrying_fetcher(&config.fetch);
    let links = match args.source {
        Source::Index => {
            let crawler = PaginationCrawler::new(config.crawl.clone())?;
            crawler.collect_links().await?
        }
        Source::Feed => {
            // Feed errors are Send + Sync boxes; narrow them to main's
            // error type by coercion.
            feed::collect_links(&fetcher, &args.feed_url, config.crawl.clamped_target())
                .await
                .map_err(|e| -> Box<dyn Error> { e })?
        }
    };
    info!(count = links.len(), source = ?args.source, "Link discovery completed");
    if links.is_empty() {
        warn!("No article links discovered; the dataset will hold no new records");
    }

    // ---- Fetch pages and assemble records ----
    let extractor = Extractor::new(config.extract.clone(), &config.images.handler_pattern)?;
    let resolver = HeroImageResolver::new(config.images.clone(), args.unsplash_key.clone())?;
    let orchestrator = Orchestrator::new(fetcher, extractor, resolver, &config.fetch);

    let records = orchestrator.process(links, args.concurrency).await;
    info!(count = records.len(), "Article assembly completed");

    // ---- Write dataset ----
    if let Err(e) = json::write_dataset(&records, &args.output_dir, args.merge).await {
        error!(error = %e, "Failed to write dataset");
        return Err(e);
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );

    Ok(())
}
