//! Page-fetcher capability and its HTTP implementation.
//!
//! The pipeline consumes pages through the [`PageFetcher`] trait so the
//! rendering backend stays swappable (plain HTTP here, a browser-automation
//! session elsewhere, a canned fixture in tests). Fetching is single-flight:
//! whatever the backend, only one fetch-and-render proceeds at a time,
//! because the underlying session is one stateful resource.

pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use url::Url;

use postvault_shared::{FetchConfig, PostVaultError, Result};

pub use retry::{IsRetryable, RetryPolicy, retry_with_backoff};

/// User-Agent string for page requests.
const USER_AGENT: &str = concat!("PostVault/", env!("CARGO_PKG_VERSION"));

/// Maximum redirects to follow on a page fetch.
const MAX_REDIRECTS: usize = 5;

// ---------------------------------------------------------------------------
// PageFetcher capability
// ---------------------------------------------------------------------------

/// Capability that turns a URL into rendered markup.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch the page at `url`, applying the backend's own bounded retry
    /// before surfacing failure.
    async fn fetch(&self, url: &Url) -> Result<String>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// One fetch attempt's failure, classified for the retry loop.
#[derive(Debug)]
enum FetchError {
    /// Timeout, transport failure, or server-side overload. Worth retrying.
    Transient(String),
    /// Client-side failure (4xx, bad response). Retrying cannot help.
    Permanent(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Transient(msg) | FetchError::Permanent(msg) => write!(f, "{msg}"),
        }
    }
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl From<FetchError> for PostVaultError {
    fn from(e: FetchError) -> Self {
        PostVaultError::Network(e.to_string())
    }
}

/// HTTP-backed [`PageFetcher`] with retry and a single-flight session guard.
pub struct HttpFetcher {
    client: Client,
    policy: RetryPolicy,
    /// Serializes fetches; the session is one stateful resource and cannot
    /// safely serve concurrent navigations.
    session: Mutex<()>,
}

impl HttpFetcher {
    /// Build a fetcher from the `[fetch]` config section.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PostVaultError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            policy: RetryPolicy {
                attempts: config.attempts.max(1),
                base_backoff: Duration::from_millis(config.base_backoff_ms),
                max_backoff: Duration::from_millis(config.max_backoff_ms),
            },
            session: Mutex::new(()),
        })
    }

    /// One attempt: GET the page and read the body.
    async fn fetch_once(&self, url: &Url) -> std::result::Result<String, FetchError> {
        let response = self.client.get(url.as_str()).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                FetchError::Transient(format!("{url}: {e}"))
            } else {
                FetchError::Permanent(format!("{url}: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let msg = format!("{url}: HTTP {status}");
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(FetchError::Transient(msg))
            } else {
                Err(FetchError::Permanent(msg))
            };
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("{url}: body read failed: {e}")))
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    #[instrument(skip_all, fields(url = %url))]
    async fn fetch(&self, url: &Url) -> Result<String> {
        // Hold the session for the whole attempt loop, retries included.
        let _session = self.session.lock().await;
        debug!("fetching page");

        let markup = retry_with_backoff(&self.policy, || self.fetch_once(url)).await?;
        debug!(bytes = markup.len(), "page fetched");
        Ok(markup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> FetchConfig {
        FetchConfig {
            attempts: 3,
            base_backoff_ms: 5,
            max_backoff_ms: 20,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn fetch_returns_markup() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/posts/popular"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_string("<html><body>ok</body></html>"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&test_config()).unwrap();
        let url = Url::parse(&format!("{}/posts/popular", server.uri())).unwrap();
        let markup = fetcher.fetch(&url).await.unwrap();
        assert!(markup.contains("ok"));
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_succeed() {
        let server = wiremock::MockServer::start().await;

        // First two attempts fail, third succeeds.
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/flaky"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/flaky"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("recovered"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&test_config()).unwrap();
        let url = Url::parse(&format!("{}/flaky", server.uri())).unwrap();
        let markup = fetcher.fetch(&url).await.unwrap();
        assert_eq!(markup, "recovered");
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_surfaces_network_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/down"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&test_config()).unwrap();
        let url = Url::parse(&format!("{}/down", server.uri())).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(matches!(err, PostVaultError::Network(_)));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/gone"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&test_config()).unwrap();
        let url = Url::parse(&format!("{}/gone", server.uri())).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}
