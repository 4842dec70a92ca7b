//! HTTP Fetch Engine for the image harvester
//!
//! This module provides a content fetcher that:
//! 1. Validates URLs and skips domains with known certificate problems
//! 2. Spaces requests through the worker's rate limiter
//! 3. Rotates user agents on 403 and retries transient statuses with exponential backoff
//! 4. Falls back to an unverified TLS client after a certificate failure

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashSet;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::harvest::config_loader::Http;
use crate::harvest::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::harvest::retry::{retry, Backoff, RetryFailure, RetryPolicy};

/// Statuses retried with exponential backoff
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Error types surfaced by a fetch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Skipped SSL-problematic domain: {0}")]
    SkippedDomain(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("HTTP error: {0}")]
    HttpError(u16),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("All {attempts} attempts exhausted, last error: {last}")]
    AllAttemptsExhausted { attempts: u32, last: String },
}

impl FetchError {
    /// Worth another attempt with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpError(status) => RETRYABLE_STATUSES.contains(status),
            FetchError::NetworkError(_) => true,
            _ => false,
        }
    }

    fn is_forbidden(&self) -> bool {
        matches!(self, FetchError::HttpError(403))
    }
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Anything that can turn an image URL into bytes
pub trait ImageSource: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> impl Future<Output = FetchResult<Vec<u8>>> + Send;
}

/// Settings for [HttpFetcher], usually built from the `[http]` config section
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_retry_delay: Duration,
    pub forbidden_attempts: u32,
    pub forbidden_backoff: Duration,
    pub rotate_user_agents: bool,
    pub user_agents: Vec<String>,
    pub ssl_skip_domains: Vec<String>,
    pub skip_marked_ssl_domains: bool,
    pub rate: RateLimiterConfig,
}

impl From<&Http> for FetcherConfig {
    fn from(http: &Http) -> Self {
        Self {
            connect_timeout: Duration::from_secs(http.connection_timeout_secs),
            request_timeout: Duration::from_secs(http.request_timeout_secs),
            max_retries: http.max_retries,
            retry_backoff: Duration::from_millis(http.retry_backoff_ms),
            max_retry_delay: Duration::from_secs(http.max_retry_delay_secs),
            forbidden_attempts: http.forbidden_attempts,
            forbidden_backoff: Duration::from_millis(http.forbidden_backoff_ms),
            rotate_user_agents: http.rotate_user_agents,
            user_agents: http.user_agents.clone(),
            ssl_skip_domains: http.ssl_skip_domains.clone(),
            skip_marked_ssl_domains: http.skip_marked_ssl_domains,
            rate: RateLimiterConfig {
                min_interval: Duration::from_millis(http.request_interval_ms),
                max_jitter: Duration::from_millis(http.jitter_ms),
            },
        }
    }
}

/// Which client an attempt goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsMode {
    Verified,
    Unverified,
}

/// reqwest-backed [ImageSource]
pub struct HttpFetcher {
    verified: Client,
    unverified: Client,
    config: Arc<FetcherConfig>,
    limiter: RateLimiter,
    problematic_domains: Arc<DashSet<String>>,
    ua_cursor: AtomicUsize,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> reqwest::Result<Self> {
        let verified = Self::build_client(&config, false)?;
        let unverified = Self::build_client(&config, true)?;

        Ok(Self {
            verified,
            unverified,
            limiter: RateLimiter::new(config.rate.clone()),
            config: Arc::new(config),
            problematic_domains: Arc::new(DashSet::new()),
            ua_cursor: AtomicUsize::new(0),
        })
    }

    fn build_client(config: &FetcherConfig, accept_invalid_certs: bool) -> reqwest::Result<Client> {
        Client::builder()
            .use_rustls_tls()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(4)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
    }

    /// A fetcher for another worker: shares clients and the problematic-domain set,
    /// but spaces its own requests.
    pub fn fork(&self) -> Self {
        Self {
            verified: self.verified.clone(),
            unverified: self.unverified.clone(),
            config: Arc::clone(&self.config),
            limiter: self.limiter.fork(),
            problematic_domains: Arc::clone(&self.problematic_domains),
            ua_cursor: AtomicUsize::new(self.ua_cursor.load(Ordering::Relaxed)),
        }
    }

    pub fn is_marked_problematic(&self, host: &str) -> bool {
        self.problematic_domains.contains(host)
    }

    /// Checks scheme and host, returning the host
    pub fn validate_url(url: &str) -> FetchResult<String> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }
        parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))
    }

    fn in_skip_list(&self, host: &str) -> bool {
        self.config
            .ssl_skip_domains
            .iter()
            .any(|pattern| !pattern.is_empty() && host.contains(pattern.as_str()))
    }

    fn next_user_agent(&self) -> Option<&str> {
        if self.config.user_agents.is_empty() {
            return None;
        }
        let index = if self.config.rotate_user_agents {
            self.ua_cursor.fetch_add(1, Ordering::Relaxed) % self.config.user_agents.len()
        } else {
            0
        };
        Some(self.config.user_agents[index].as_str())
    }

    fn headers(&self, url: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(ua) = self.next_user_agent() {
            if let Ok(value) = HeaderValue::from_str(ua) {
                headers.insert(header::USER_AGENT, value);
            }
        }
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("image/avif,image/webp,image/apng,image/*,*/*;q=0.8"),
        );
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        if let Ok(value) = HeaderValue::from_str(url) {
            headers.insert(header::REFERER, value);
        }
        headers
    }

    async fn attempt(&self, mode: TlsMode, url: &str) -> FetchResult<Vec<u8>> {
        self.limiter.wait_turn().await;

        let client = match mode {
            TlsMode::Verified => &self.verified,
            TlsMode::Unverified => &self.unverified,
        };
        let result = match client.get(url).headers(self.headers(url)).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    response
                        .bytes()
                        .await
                        .map(|bytes| bytes.to_vec())
                        .map_err(|e| classify_transport_error(&e))
                } else {
                    Err(FetchError::HttpError(status.as_u16()))
                }
            }
            Err(e) => Err(classify_transport_error(&e)),
        };

        self.limiter.mark_completion();
        result
    }

    /// Transient statuses and network errors, with exponential backoff
    async fn fetch_with_backoff(&self, mode: TlsMode, url: &str) -> FetchResult<Vec<u8>> {
        let policy = RetryPolicy::new(
            self.config.max_retries + 1,
            Backoff::Exponential {
                base: self.config.retry_backoff,
                max: self.config.max_retry_delay,
                jitter: Duration::from_millis(100),
            },
            FetchError::is_transient,
        );

        retry(&policy, |_| self.attempt(mode, url))
            .await
            .map_err(|failure| match failure {
                RetryFailure::Permanent(e) => e,
                RetryFailure::Exhausted { attempts, last } => FetchError::AllAttemptsExhausted {
                    attempts,
                    last: last.to_string(),
                },
            })
    }

    /// 403 gets a fresh user agent after a fixed pause
    async fn fetch_rotating(&self, mode: TlsMode, url: &str) -> FetchResult<Vec<u8>> {
        let attempts = if self.config.rotate_user_agents {
            self.config.forbidden_attempts
        } else {
            1
        };
        let policy = RetryPolicy::new(
            attempts,
            Backoff::Fixed(self.config.forbidden_backoff),
            FetchError::is_forbidden,
        );

        retry(&policy, |attempt| {
            if attempt > 1 {
                debug!("403 from {}, rotating user agent (attempt {})", url, attempt);
            }
            self.fetch_with_backoff(mode, url)
        })
        .await
        .map_err(|failure| match failure {
            RetryFailure::Permanent(e) => e,
            RetryFailure::Exhausted { attempts, last } => FetchError::AllAttemptsExhausted {
                attempts,
                last: last.to_string(),
            },
        })
    }
}

impl ImageSource for HttpFetcher {
    #[instrument(skip(self), level = "debug")]
    async fn fetch(&self, url: &str) -> FetchResult<Vec<u8>> {
        let host = Self::validate_url(url)?;

        if self.in_skip_list(&host) {
            return Err(FetchError::SkippedDomain(host));
        }

        let marked = self.is_marked_problematic(&host);
        if marked && self.config.skip_marked_ssl_domains {
            return Err(FetchError::SkippedDomain(host));
        }

        let first_mode = if marked { TlsMode::Unverified } else { TlsMode::Verified };
        match self.fetch_rotating(first_mode, url).await {
            Err(FetchError::TlsError(reason)) if first_mode == TlsMode::Verified => {
                warn!("TLS failure for {}, retrying without verification: {}", host, reason);
                self.problematic_domains.insert(host);
                self.fetch_rotating(TlsMode::Unverified, url).await
            }
            other => other,
        }
    }
}

/// Maps a reqwest failure to `TlsError` when any cause mentions certificates or handshakes
fn classify_transport_error(error: &reqwest::Error) -> FetchError {
    let mut chain = Vec::new();
    let mut source: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    let text = chain.join(": ");
    let lowered = text.to_ascii_lowercase();

    if ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        FetchError::TlsError(text)
    } else {
        FetchError::NetworkError(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FetcherConfig {
        let mut config = FetcherConfig::from(&Http::default());
        config.ssl_skip_domains = vec!["badcert.example".to_string()];
        config.rate = RateLimiterConfig {
            min_interval: Duration::ZERO,
            max_jitter: Duration::ZERO,
        };
        config
    }

    #[test]
    fn test_validate_url() {
        assert_eq!(HttpFetcher::validate_url("https://a.example/x.jpg").ok(), Some("a.example".to_string()));
        assert!(matches!(HttpFetcher::validate_url("not a url"), Err(FetchError::InvalidUrl(_))));
        assert!(matches!(HttpFetcher::validate_url("data:image/png;base64,AAAA"), Err(FetchError::InvalidUrl(_))));
        assert!(matches!(HttpFetcher::validate_url("ftp://a.example/x.jpg"), Err(FetchError::InvalidUrl(_))));
    }

    #[test]
    fn test_status_classes() {
        for status in RETRYABLE_STATUSES {
            assert!(FetchError::HttpError(status).is_transient());
        }
        for status in [400, 401, 403, 404, 410, 451] {
            assert!(!FetchError::HttpError(status).is_transient());
        }
        assert!(FetchError::NetworkError("reset".to_string()).is_transient());
        assert!(!FetchError::TlsError("bad cert".to_string()).is_transient());
    }

    #[tokio::test]
    async fn test_invalid_url_fails_fast() {
        let fetcher = HttpFetcher::new(config()).expect("client");
        assert!(matches!(fetcher.fetch("/relative/path.png").await, Err(FetchError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_skip_list_domain_is_skipped() {
        let fetcher = HttpFetcher::new(config()).expect("client");
        let result = fetcher.fetch("https://cdn.badcert.example/a.jpg").await;
        assert_eq!(result, Err(FetchError::SkippedDomain("cdn.badcert.example".to_string())));
    }

    #[tokio::test]
    async fn test_marked_domain_is_skipped() {
        let fetcher = HttpFetcher::new(config()).expect("client");
        fetcher.problematic_domains.insert("flaky.example".to_string());

        let forked = fetcher.fork();
        assert!(forked.is_marked_problematic("flaky.example"));
        assert_eq!(
            forked.fetch("https://flaky.example/a.jpg").await,
            Err(FetchError::SkippedDomain("flaky.example".to_string()))
        );
    }

    #[test]
    fn test_user_agents_rotate() {
        let fetcher = HttpFetcher::new(config()).expect("client");
        let first = fetcher.next_user_agent().map(str::to_string);
        let second = fetcher.next_user_agent().map(str::to_string);
        assert_ne!(first, second);
    }
}
