// 🌐 Page Fetching - the only place the pipeline touches the network
//
// Adapters never own an HTTP client; they receive a `PageFetcher`. The real
// one wraps reqwest with a shared pacer, the static one serves canned pages
// so every adapter and the orchestrator can be tested offline. The static
// one only exists in test builds.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

// ============================================================================
// FETCH ERROR
// ============================================================================

/// Failure of one fetch attempt, classified for the retry utility
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("unexpected page structure at {url}: {message}")]
    Structural { url: String, message: String },
}

impl FetchError {
    pub fn structural(url: &str, message: impl Into<String>) -> Self {
        FetchError::Structural {
            url: url.to_string(),
            message: message.into(),
        }
    }

    /// Transient failures are retried; structural ones are final
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Structural { .. })
    }

    pub fn url(&self) -> &str {
        match self {
            FetchError::Timeout { url, .. }
            | FetchError::Status { url, .. }
            | FetchError::Network { url, .. }
            | FetchError::Structural { url, .. } => url,
        }
    }
}

// ============================================================================
// CONTENT TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Html,
    Markdown,
}

impl ContentType {
    pub fn accept_header(&self) -> &'static str {
        match self {
            ContentType::Html => "text/html,application/xhtml+xml;q=0.9,*/*;q=0.5",
            ContentType::Markdown => "text/markdown,text/plain;q=0.9",
        }
    }
}

// ============================================================================
// FETCHER TRAIT
// ============================================================================

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// GET a page body. Non-2xx responses are errors.
    async fn get(&self, url: &str, content_type: ContentType) -> Result<String, FetchError>;
}

// ============================================================================
// PACER (shared inter-request delay)
// ============================================================================

/// Spaces request starts at least `delay` apart across all workers
pub struct Pacer {
    delay: Duration,
    last_request_at: tokio::sync::Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(delay_ms: u64) -> Self {
        Pacer {
            delay: Duration::from_millis(delay_ms),
            last_request_at: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        if self.delay.is_zero() {
            return;
        }

        let mut last = self.last_request_at.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

// ============================================================================
// HTTP FETCHER
// ============================================================================

pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: String,
    timeout_ms: u64,
    pacer: Pacer,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout_ms: u64, request_delay_ms: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("failed to build HTTP client")?;

        Ok(HttpFetcher {
            client,
            user_agent: user_agent.to_string(),
            timeout_ms,
            pacer: Pacer::new(request_delay_ms),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get(&self, url: &str, content_type: ContentType) -> Result<String, FetchError> {
        self.pacer.wait().await;
        debug!(url = url, "GET");

        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout_ms: self.timeout_ms,
                }
            } else {
                FetchError::Network {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        };

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, self.user_agent.as_str())
            .header(ACCEPT, content_type.accept_header())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(classify)
    }
}

// ============================================================================
// STATIC FETCHER (offline pages)
// ============================================================================

#[cfg(test)]
pub use self::fixtures::StaticFetcher;


// ============================================================================
// TESTS
// ============================================================================
