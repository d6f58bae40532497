//! Article-page HTTP fetching with exponential backoff retry logic.
//!
//! Government sites rate-limit and flap; a single 502 must not cost us an
//! article. This module provides a robust page-fetch interface with
//! automatic retry, exponential backoff and jitter.
//!
//! # Architecture
//!
//! The module uses a trait-based design for flexibility:
//! - [`PageFetch`]: Core trait defining an async page fetch
//! - [`HttpFetch`]: reqwest-backed implementation over the shared client
//! - [`RetryFetch`]: Decorator that adds retry logic to any `PageFetch`
//!   implementation
//!
//! The trait seam is what lets the orchestrator run against an injected
//! fetcher, so failure handling can be exercised without a network.
//!
//! # Retry Strategy
//!
//! - Bounded retry attempts (3 by default)
//! - Exponential backoff starting at 500ms
//! - Maximum delay capped at 10 seconds
//! - Random jitter (0-250ms) added to prevent thundering herd

use crate::config::FetchConfig;
use once_cell::sync::Lazy;
use rand::{rng, Rng};
use reqwest::Client;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::{Duration as StdDuration, Instant};
use tokio::time::sleep;
use tracing::{error, instrument, warn};

/// Shared HTTP client for every plain (non-browser) request the pipeline
/// makes. Browser-like UA keeps bot-hostile frontends from short-circuiting
/// us; the redirect cap bounds handler-style endpoints that bounce around.
pub(crate) static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(concat!(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) ",
            "AppleWebKit/537.36 (KHTML, like Gecko) ",
            "Chrome/127.0.0.0 Safari/537.36"
        ))
        .timeout(StdDuration::from_secs(20))
        .pool_idle_timeout(StdDuration::from_secs(10))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .expect("failed to build reqwest client")
});

/// Trait for async page fetching.
///
/// Implementors take a URL and return the page body as text. The `Send`
/// bound on the returned future is what allows fetchers to be driven from
/// spawned worker tasks.
pub trait PageFetch {
    /// Fetch the document at `url` and return its body.
    fn fetch(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<String, Box<dyn Error + Send + Sync>>> + Send;
}

/// reqwest-backed [`PageFetch`] over the shared [`CLIENT`].
///
/// Non-2xx statuses are errors here; the retry layer above decides whether
/// to try again.
#[derive(Debug, Clone)]
pub struct HttpFetch {
    timeout: StdDuration,
}

impl HttpFetch {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            timeout: StdDuration::from_secs(config.timeout_secs),
        }
    }
}

impl PageFetch for HttpFetch {
    #[instrument(level = "info", skip_all, fields(%url))]
    async fn fetch(&self, url: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let t0 = Instant::now();
        let res = CLIENT.get(url).timeout(self.timeout).send().await;

        match res {
            Ok(response) => {
                let response = response.error_for_status()?;
                let body = response.text().await?;
                Ok(body)
            }
            Err(e) => {
                let dt = t0.elapsed();
                warn!(elapsed_ms = dt.as_millis() as u128, error = %e, "Page fetch failed");
                Err(Box::new(e))
            }
        }
    }
}

/// Wrapper that adds exponential backoff retry logic to any [`PageFetch`]
/// implementation.
///
/// # Backoff Strategy
///
/// The delay between retries follows this formula:
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
pub struct RetryFetch<T> {
    /// The underlying fetcher to wrap.
    inner: T,
    /// Maximum number of retry attempts before giving up.
    max_retries: usize,
    /// Initial delay between retries (doubles with each attempt).
    base_delay: StdDuration,
    /// Maximum delay cap to prevent excessive waiting.
    max_delay: StdDuration,
}

impl<T> RetryFetch<T>
where
    T: PageFetch,
{
    pub fn new(inner: T, max_retries: usize, base_delay: StdDuration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: StdDuration::from_secs(10),
        }
    }
}

impl<T> fmt::Debug for RetryFetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFetch")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T> PageFetch for RetryFetch<T>
where
    T: PageFetch + Sync,
{
    #[instrument(level = "info", skip_all, fields(%url))]
    async fn fetch(&self, url: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match self.inner.fetch(url).await {
                Ok(body) => {
                    return Ok(body);
                }
                Err(e) => {
                    attempt += 1;
                    let attempt_dt = attempt_t0.elapsed();
                    let total_dt = total_t0.elapsed();

                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_attempt = attempt_dt.as_millis() as u128,
                            elapsed_ms_total = total_dt.as_millis() as u128,
                            error = %e,
                            "fetch() exhausted retries"
                        );
                        return Err(e);
                    }

                    // backoff calc
                    let delay = backoff_delay(self.base_delay, attempt, self.max_delay);
                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay = delay + StdDuration::from_millis(jitter_ms);

                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis() as u128,
                        elapsed_ms_total = total_dt.as_millis() as u128,
                        ?delay,
                        error = %e,
                        "fetch() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Backoff for a 1-based attempt: `base * 2^(attempt-1)`, exponent clamped
/// so deep retry counts cannot overflow the shift, capped at `cap`.
fn backoff_delay(base: StdDuration, attempt: usize, cap: StdDuration) -> StdDuration {
    let exp = attempt.saturating_sub(1).min(16) as u32;
    let delay = base.saturating_mul(1u32 << exp);
    if delay > cap {
        cap
    } else {
        delay
    }
}

/// Build the production fetcher stack: shared-client HTTP fetch wrapped in
/// retry-with-backoff, tuned from config.
pub fn retrying_fetcher(config: &FetchConfig) -> RetryFetch<HttpFetch> {
    RetryFetch::new(
        HttpFetch::new(config),
        config.max_retries,
        config.base_delay(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl PageFetch for Flaky {
        async fn fetch(&self, _url: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err("transient".into())
            } else {
                Ok("<html>ok</html>".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let flaky = Flaky {
            fail_first: 2,
            calls: AtomicUsize::new(0),
        };
        let fetcher = RetryFetch::new(flaky, 3, StdDuration::from_millis(1));

        let body = fetcher.fetch("https://example.org/a").await.unwrap();
        assert_eq!(body, "<html>ok</html>");
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_and_propagates() {
        let always_down = Flaky {
            fail_first: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        let fetcher = RetryFetch::new(always_down, 2, StdDuration::from_millis(1));

        let err = fetcher.fetch("https://example.org/a").await.unwrap_err();
        assert_eq!(err.to_string(), "transient");
        // initial attempt + 2 retries
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retries_on_first_success() {
        let healthy = Flaky {
            fail_first: 0,
            calls: AtomicUsize::new(0),
        };
        let fetcher = RetryFetch::new(healthy, 3, StdDuration::from_millis(1));

        fetcher.fetch("https://example.org/a").await.unwrap();
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let base = StdDuration::from_millis(500);
        let cap = StdDuration::from_secs(10);
        assert_eq!(backoff_delay(base, 1, cap), base);
        assert_eq!(backoff_delay(base, 2, cap), StdDuration::from_millis(1000));
        assert_eq!(backoff_delay(base, 5, cap), StdDuration::from_millis(8000));
        assert_eq!(backoff_delay(base, 6, cap), cap);
        // Deep retry counts stay at the cap instead of overflowing the
        // shift.
        assert_eq!(backoff_delay(base, 70, cap), cap);
    }
}
