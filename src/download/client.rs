//! HTTP client wrapper shared by metadata probes and segment transfers.
//!
//! [`HttpClient`] owns one pooled `reqwest::Client` configured from
//! [`DownloadOptions`] and turns reqwest failures into [`DownloadError`]
//! variants the retry policy can classify:
//!
//! - connect timeouts → `Timeout { phase: Connect }`
//! - no response headers within `header_timeout` → `Timeout { phase: Headers }`
//! - body silent for `read_timeout` → `Timeout { phase: Body }`
//! - reset / aborted / broken pipe / unexpected EOF → `ConnectionReset`
//! - everything else → `Network`
//!
//! The client never checks status codes; callers decide what a status means.

use std::error::Error as _;
use std::io;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response};
use tracing::{instrument, trace};
use url::Url;

use super::error::{DownloadError, TimeoutPhase};
use crate::config::DownloadOptions;

/// Pooled HTTP client with per-phase timeouts.
///
/// Cheap to clone; clones share the connection pool.
///
/// # Example
///
/// ```no_run
/// use resumable_fetch::DownloadOptions;
/// use resumable_fetch::download::HttpClient;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new(&DownloadOptions::default())?;
/// # drop(client);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    header_timeout: Duration,
}

impl HttpClient {
    /// Builds a client from `options`.
    ///
    /// Redirects are followed (up to reqwest's default of 10). No total
    /// request timeout is set: a large body may stream for as long as it keeps
    /// making progress.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend cannot be
    /// initialised.
    #[instrument(level = "debug", skip(options), fields(user_agent = %options.user_agent))]
    pub fn new(options: &DownloadOptions) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .user_agent(options.user_agent.as_str())
            .build()?;
        Ok(Self {
            client,
            header_timeout: options.header_timeout,
        })
    }

    /// Sends `method` to `url` with `headers` and waits for response headers.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] for non-HTTP(S) or unparsable
    /// URLs, and a timeout or network error if no response arrives.
    pub(crate) async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<Response, DownloadError> {
        let parsed = parse_http_url(url)?;
        trace!(url = %url, method = %method, "sending request");
        let request = self
            .client
            .request(method, parsed)
            .headers(headers.clone())
            .send();

        match tokio::time::timeout(self.header_timeout, request).await {
            Ok(result) => result.map_err(|e| map_request_error(url, e, TimeoutPhase::Headers)),
            Err(_) => Err(DownloadError::timeout(url, TimeoutPhase::Headers)),
        }
    }
}

/// Parses `url` and rejects schemes other than `http` and `https`.
pub(crate) fn parse_http_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(DownloadError::invalid_url(url)),
    }
}

/// Maps a reqwest failure to the error taxonomy.
///
/// `timeout_phase` names the phase a non-connect timeout belongs to.
pub(crate) fn map_request_error(
    url: &str,
    error: reqwest::Error,
    timeout_phase: TimeoutPhase,
) -> DownloadError {
    if error.is_timeout() {
        let phase = if error.is_connect() {
            TimeoutPhase::Connect
        } else {
            timeout_phase
        };
        return DownloadError::timeout(url, phase);
    }
    if error.is_builder() {
        return DownloadError::invalid_url(url);
    }
    if let Some(kind) = socket_error_kind(&error) {
        return DownloadError::connection_reset(url, io::Error::new(kind, error.to_string()));
    }
    DownloadError::network(url, error)
}

/// Finds a reset-like IO error anywhere in the source chain.
fn socket_error_kind(error: &reqwest::Error) -> Option<io::ErrorKind> {
    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io_error) = err.downcast_ref::<io::Error>() {
            let kind = io_error.kind();
            if matches!(
                kind,
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return Some(kind);
            }
        }
        source = err.source();
    }
    None
}
