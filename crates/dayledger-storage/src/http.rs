//! Shared HTTP transport for the source adapters.
//!
//! The fetcher bounds concurrency globally and per source, and classifies
//! failures as retryable or not. It never retries on its own; retries belong
//! to the sync executor so that every attempt is visible there.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dayledger_core::SourceKind;
use reqwest::header::LINK;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

const DEFAULT_USER_AGENT: &str = concat!("dayledger/", env!("CARGO_PKG_VERSION"));

/// Whether the retry executor should try a failed call again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RetryDisposition::Retryable,
        s if s.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Timeouts and connection or body failures are transient. Builder and
/// redirect errors are not.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    let transient = err.is_timeout() || err.is_connect() || err.is_request() || err.is_body();
    if transient {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across all sources.
    pub max_in_flight: usize,
    /// Requests in flight against any one source.
    pub max_in_flight_per_source: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 8,
            max_in_flight_per_source: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    /// Raw `Link` header, used by cursor-paginated APIs.
    pub link: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => match StatusCode::from_u16(*status) {
                Ok(code) => classify_status(code),
                Err(_) => RetryDisposition::NonRetryable,
            },
            FetchError::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    per_source_cap: usize,
    source_gates: Mutex<HashMap<SourceKind, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT))
            .build()
            .context("building HTTP client for source adapters")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_source_cap: config.max_in_flight_per_source.max(1),
            source_gates: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying client, for building requests passed to [`Self::execute`].
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn gate_for(&self, source: SourceKind) -> Arc<Semaphore> {
        self.source_gates
            .lock()
            .await
            .entry(source)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_cap)))
            .clone()
    }

    /// Sends one request. Non-2xx responses become [`FetchError::HttpStatus`].
    pub async fn execute(
        &self,
        source: SourceKind,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let gate = self.gate_for(source).await;
        // Both semaphores live as long as the fetcher and are never closed.
        let _permits = (
            self.in_flight.acquire().await.expect("semaphore not closed"),
            gate.acquire().await.expect("semaphore not closed"),
        );

        async move {
            let response = request.send().await?;
            let status = response.status();
            let final_url = response.url().to_string();
            if !status.is_success() {
                debug!(status = status.as_u16(), url = %final_url, "source answered with an error status");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let link = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let body = response.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                link,
                body,
            })
        }
        .instrument(info_span!("http_fetch", %source))
        .await
    }
}

/// Extracts the `rel="next"` target from an RFC 8288 `Link` header.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim();
            p.eq_ignore_ascii_case("rel=\"next\"") || p.eq_ignore_ascii_case("rel=next")
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(ToString::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn status_errors_carry_their_disposition() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://example.test".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        let err = FetchError::HttpStatus {
            status: 403,
            url: "https://example.test".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn next_link_is_extracted_from_link_header() {
        let header = r#"<https://shop.example/admin/api/2024-01/orders.json?page_info=abc&limit=250>; rel="previous", <https://shop.example/admin/api/2024-01/orders.json?page_info=def&limit=250>; rel="next""#;
        assert_eq!(
            next_link(header).as_deref(),
            Some("https://shop.example/admin/api/2024-01/orders.json?page_info=def&limit=250")
        );
        assert_eq!(next_link(r#"<https://x.example/?p=1>; rel="previous""#), None);
    }
}
