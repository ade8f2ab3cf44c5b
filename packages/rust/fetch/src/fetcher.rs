//! Single-page network retrieval with retry and backoff.
//!
//! [`HttpFetcher`] follows redirects itself instead of letting `reqwest` do it,
//! so every hop spends one attempt from the same budget as failures do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use tracing::{debug, instrument, warn};
use url::Url;

use folio_shared::{FetchConfig, FolioError, Result};

/// Largest exponent used for rate-limit backoff (`delay × 2^n`).
const MAX_BACKOFF_SHIFT: u32 = 10;

/// Anything that can turn a URL into a page body.
///
/// The job pipeline only ever talks to this trait, which keeps the transport
/// swappable and lets tests count, fail, or delay individual requests.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<String>;
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// `reqwest`-backed fetcher with linear backoff for transient errors and
/// exponential backoff for rate limiting.
pub struct HttpFetcher {
    client: Client,
    max_attempts: u32,
    retry_delay: Duration,
    /// Set while we are inside a streak of rate-limit responses; only the
    /// first one of a streak is logged at warn level.
    rate_limited: AtomicBool,
}

/// Outcome of one HTTP exchange.
enum Exchange {
    Body(String),
    Redirect(Url),
}

impl HttpFetcher {
    /// Build a fetcher with its own connection pool.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout())
            .build()
            .map_err(|e| FolioError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            rate_limited: AtomicBool::new(false),
        })
    }

    async fn exchange(&self, url: &Url) -> Result<Exchange> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(FolioError::Rejected(format!(
                    "{url}: unsupported scheme '{other}'"
                )));
            }
        }

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| FolioError::Network(format!("{url}: {e}")))?;

        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    FolioError::Rejected(format!("{url}: HTTP {status} without Location"))
                })?;
            let target = url.join(location).map_err(|e| {
                FolioError::Rejected(format!("{url}: bad redirect target '{location}': {e}"))
            })?;
            return Ok(Exchange::Redirect(target));
        }

        if status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::SERVICE_UNAVAILABLE
                && response.headers().contains_key(header::RETRY_AFTER))
        {
            return Err(FolioError::RateLimited(format!("{url}: HTTP {status}")));
        }

        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            return Err(FolioError::Network(format!("{url}: HTTP {status}")));
        }

        if !status.is_success() {
            return Err(FolioError::Rejected(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FolioError::Network(format!("{url}: body read failed: {e}")))?;

        Ok(Exchange::Body(body))
    }

    /// Marks the fetcher as rate limited. Returns `true` only for the first
    /// rate-limit response since the last successful fetch.
    fn enter_rate_limit_streak(&self) -> bool {
        !self.rate_limited.swap(true, Ordering::Relaxed)
    }

    fn log_retry(&self, url: &Url, error: &FolioError, attempt: u32, delay: Duration) {
        if error.is_rate_limit() {
            if self.enter_rate_limit_streak() {
                warn!(%url, attempt, delay_ms = delay.as_millis(), "rate limited, backing off");
            } else {
                debug!(%url, attempt, delay_ms = delay.as_millis(), "still rate limited");
            }
        } else {
            warn!(
                %url,
                error = %error,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis(),
                "fetch failed, retrying"
            );
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip_all, fields(url = %url))]
    async fn fetch(&self, url: &Url) -> Result<String> {
        let mut current = url.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.exchange(&current).await {
                Ok(Exchange::Body(body)) => {
                    self.rate_limited.store(false, Ordering::Relaxed);
                    if attempt > 1 {
                        debug!(attempts = attempt, "fetch succeeded after retry");
                    }
                    return Ok(body);
                }
                // Redirect hops share the retry budget; a redirect cycle ends
                // when the budget runs out.
                Ok(Exchange::Redirect(target)) => {
                    if attempt >= self.max_attempts {
                        return Err(FolioError::Network(format!(
                            "{url}: gave up following redirects at {target}"
                        )));
                    }
                    debug!(from = %current, to = %target, attempt, "following redirect");
                    current = target;
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = backoff_delay(self.retry_delay, attempt, e.is_rate_limit());
                    self.log_retry(&current, &e, attempt, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!(error = %e, attempts = attempt, "fetch failed");
                    return Err(e);
                }
            }
        }
    }
}

/// Delay before the next attempt: `base × attempt` for ordinary failures,
/// `base × 2^(attempt-1)` when rate limited. Saturates at [`Duration::MAX`].
pub(crate) fn backoff_delay(base: Duration, attempt: u32, rate_limited: bool) -> Duration {
    let attempt = attempt.max(1);
    let factor = if rate_limited {
        1u32 << (attempt - 1).min(MAX_BACKOFF_SHIFT)
    } else {
        attempt
    };
    base.saturating_mul(factor)
}
