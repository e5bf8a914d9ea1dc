//! Metadata probing: what is behind a URL before any byte is fetched.
//!
//! The probe is a HEAD request (a GET whose body is dropped after the headers
//! when the server answers HEAD with 405). From the response it extracts the
//! final URL after redirects, range support, length, `ETag` and
//! `Last-Modified`, and captures a [`CachePolicy`] for checkpointing.
//!
//! Status handling:
//! - 200 / 201 → [`ProbeOutcome::Fresh`]
//! - 304 on a conditional probe → [`ProbeOutcome::NotModified`]
//! - anything else → [`FetchMetadataError`], never retried
//!
//! Transient network failures (timeouts, resets) are retried with the
//! engine's [`RetryPolicy`] before the URL is given up.

use std::time::SystemTime;

use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, ETAG, HeaderMap, LAST_MODIFIED};
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::cache_policy::CachePolicy;
use super::client::HttpClient;
use super::error::{AttemptError, DownloadError, FetchMetadataError};
use super::retry::{RetryDecision, RetryPolicy};

/// What the server said about a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    /// Final URL after redirects; segment requests go here.
    pub url: String,
    /// `Accept-Ranges: bytes` was present.
    pub accept_ranges: bool,
    /// Full length, if the server sent one.
    pub content_length: Option<u64>,
    /// Raw `Last-Modified` header.
    pub last_modified: Option<String>,
    /// Raw `ETag` header.
    pub etag: Option<String>,
}

impl ResourceMetadata {
    /// Metadata for `url` with nothing known about it.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            accept_ranges: false,
            content_length: None,
            last_modified: None,
            etag: None,
        }
    }

    /// Returns true if the resource can be fetched as parallel ranges.
    #[must_use]
    pub fn supports_segments(&self) -> bool {
        self.accept_ranges && self.content_length.is_some()
    }

    fn from_response(response: &Response) -> Self {
        let headers = response.headers();
        Self {
            url: response.url().to_string(),
            accept_ranges: header_str(headers, ACCEPT_RANGES.as_str())
                .is_some_and(|value| value.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes"))),
            // reqwest reports 0 for HEAD bodies, so read the header itself.
            content_length: header_str(headers, CONTENT_LENGTH.as_str())
                .and_then(|value| value.trim().parse().ok()),
            last_modified: header_str(headers, LAST_MODIFIED.as_str()).map(str::to_string),
            etag: header_str(headers, ETAG.as_str()).map(str::to_string),
        }
    }
}

/// Result of a metadata probe.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// The server described the current representation.
    Fresh {
        /// Extracted metadata.
        metadata: ResourceMetadata,
        /// Caching policy of the probe response.
        policy: CachePolicy,
    },
    /// A conditional probe confirmed the stored representation is current.
    NotModified {
        /// Stored policy refreshed with the 304's headers.
        policy: CachePolicy,
    },
}

/// Sends metadata probes with retry and cancellation.
#[derive(Debug, Clone)]
pub struct MetadataResolver {
    client: HttpClient,
    retry: RetryPolicy,
}

impl MetadataResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(client: HttpClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Probes `url`.
    ///
    /// When `conditional` is given the probe carries its revalidation headers
    /// and may return [`ProbeOutcome::NotModified`].
    ///
    /// # Errors
    ///
    /// - [`AttemptError::Metadata`] for a status outside 200/201 (and 304 on a
    ///   conditional probe)
    /// - [`AttemptError::Transfer`] when retries are exhausted, the error is
    ///   permanent, or `cancel` fired ([`DownloadError::Cancelled`])
    #[instrument(level = "debug", skip(self, headers, conditional, cancel), fields(url = %url, conditional = conditional.is_some()))]
    pub async fn probe(
        &self,
        url: &str,
        headers: &HeaderMap,
        conditional: Option<&CachePolicy>,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, AttemptError> {
        let mut request_headers = headers.clone();
        if let Some(policy) = conditional {
            request_headers.extend(policy.revalidation_headers());
        }

        let mut attempt = 1;
        loop {
            let error = match self.probe_once(url, &request_headers, conditional, cancel).await {
                Ok(outcome) => return Ok(outcome),
                Err(AttemptError::Transfer(error)) => error,
                Err(other) => return Err(other),
            };

            match self.retry.decide(url, attempt, &error) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    tokio::select! {
                        () = cancel.cancelled() => return Err(DownloadError::cancelled(url).into()),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { .. } => return Err(error.into()),
            }
        }
    }

    async fn probe_once(
        &self,
        url: &str,
        headers: &HeaderMap,
        conditional: Option<&CachePolicy>,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, AttemptError> {
        let mut response = self.send(Method::HEAD, url, headers, cancel).await?;
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            debug!(url = %url, "HEAD not allowed, probing with GET");
            response = self.send(Method::GET, url, headers, cancel).await?;
        }
        let received_at = SystemTime::now();
        let status = response.status();

        match (status.as_u16(), conditional) {
            (200 | 201, _) => {
                let metadata = ResourceMetadata::from_response(&response);
                let policy = CachePolicy::from_response(&metadata.url, response.headers(), received_at);
                debug!(
                    url = %metadata.url,
                    accept_ranges = metadata.accept_ranges,
                    content_length = ?metadata.content_length,
                    "metadata resolved"
                );
                Ok(ProbeOutcome::Fresh { metadata, policy })
            }
            (304, Some(stored)) => {
                debug!(url = %url, "server confirmed checkpoint is current");
                Ok(ProbeOutcome::NotModified {
                    policy: stored.revalidated(response.headers(), received_at),
                })
            }
            (code, _) => Err(FetchMetadataError::new(url, code).into()),
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<Response, DownloadError> {
        tokio::select! {
            () = cancel.cancelled() => Err(DownloadError::cancelled(url)),
            result = self.client.send(method, url, headers) => result,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
