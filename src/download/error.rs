//! Error types for the download module.
//!
//! Errors are layered the same way failures propagate:
//! - [`DownloadError`] describes one request attempt for one segment and is
//!   resolved in place by the [`RetryPolicy`](super::RetryPolicy)
//! - [`AttemptError`] describes why one candidate URL was abandoned
//! - [`FetchError`] is the single error a `download()` call returns

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Phase of an HTTP exchange in which a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// TCP/TLS connection could not be established in time.
    Connect,
    /// Connected, but response headers did not arrive in time.
    Headers,
    /// Body stream stalled longer than the read timeout.
    Body,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connect"),
            Self::Headers => f.write_str("headers"),
            Self::Body => f.write_str("body"),
        }
    }
}

/// Errors from a single request attempt (metadata probe or segment transfer).
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// A connect, header or body timeout fired.
    #[error("{phase} timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
        /// Which phase of the exchange stalled.
        phase: TimeoutPhase,
    },

    /// The connection was reset or the pipe broke mid-transfer.
    #[error("connection reset fetching {url}: {source}")]
    ConnectionReset {
        /// The URL being fetched.
        url: String,
        /// The socket error reported by the OS.
        #[source]
        source: std::io::Error,
    },

    /// The body ended before the requested range was complete.
    #[error("body of {url} ended early: expected {expected} more bytes, got {received}")]
    Truncated {
        /// The URL being fetched.
        url: String,
        /// Bytes the range still needed when the request started.
        expected: u64,
        /// Bytes actually received.
        received: u64,
    },

    /// Unexpected HTTP status on a transfer request.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The server answered a mid-file range request with the whole entity.
    #[error("server ignored range request starting at byte {offset} for {url}")]
    RangeNotHonored {
        /// The URL being fetched.
        url: String,
        /// First byte of the requested range.
        offset: u64,
    },

    /// Writing or syncing the destination failed.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The destination path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The shared cancellation signal fired.
    #[error("download of {url} cancelled")]
    Cancelled {
        /// The URL being fetched when cancellation was observed.
        url: String,
    },

    /// A segment task panicked or was torn down unexpectedly.
    #[error("segment task failed: {reason}")]
    TaskFailed {
        /// Description from the join error.
        reason: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error for the given phase.
    pub fn timeout(url: impl Into<String>, phase: TimeoutPhase) -> Self {
        Self::Timeout {
            url: url.into(),
            phase,
        }
    }

    /// Creates a connection reset error.
    pub fn connection_reset(url: impl Into<String>, source: std::io::Error) -> Self {
        Self::ConnectionReset {
            url: url.into(),
            source,
        }
    }

    /// Creates a truncated body error.
    pub fn truncated(url: impl Into<String>, expected: u64, received: u64) -> Self {
        Self::Truncated {
            url: url.into(),
            expected,
            received,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an ignored-range error.
    pub fn range_not_honored(url: impl Into<String>, offset: u64) -> Self {
        Self::RangeNotHonored {
            url: url.into(),
            offset,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Returns true if this error came from the cancellation signal.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Classification of a failed metadata probe by status code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataErrorKind {
    /// 404 Not Found or 410 Gone.
    NotFound,
    /// Any other 4xx.
    BadRequest,
    /// Any 5xx.
    ServerUnavailable,
    /// Anything else outside 200/201 (1xx, other 2xx, unresolved 3xx).
    Unexpected,
}

impl MetadataErrorKind {
    /// Classifies a probe status code.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            404 | 410 => Self::NotFound,
            400..=499 => Self::BadRequest,
            500..=599 => Self::ServerUnavailable,
            _ => Self::Unexpected,
        }
    }
}

impl fmt::Display for MetadataErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::BadRequest => f.write_str("bad request"),
            Self::ServerUnavailable => f.write_str("server unavailable"),
            Self::Unexpected => f.write_str("unexpected status"),
        }
    }
}

/// The metadata probe got a status outside {200, 201}.
#[derive(Debug, Error)]
#[error("fetching metadata for {url} failed ({kind}): HTTP {status}")]
pub struct FetchMetadataError {
    /// The probed URL.
    pub url: String,
    /// The final HTTP status code.
    pub status: u16,
    /// Status classification.
    pub kind: MetadataErrorKind,
}

impl FetchMetadataError {
    /// Creates a metadata error, classifying the status.
    pub fn new(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            status,
            kind: MetadataErrorKind::from_status(status),
        }
    }
}

/// Post-transfer integrity failures.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The file digest differs from the expected one.
    #[error("{algorithm} checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumNotMatch {
        /// Hash algorithm name.
        algorithm: &'static str,
        /// Expected lowercase hex digest.
        expected: String,
        /// Actual lowercase hex digest.
        actual: String,
        /// The validated file.
        path: PathBuf,
    },

    /// The file is not a well-formed archive.
    #[error("{path} is not a valid archive: {reason}")]
    MalformedArchive {
        /// The validated file.
        path: PathBuf,
        /// What structural check failed.
        reason: &'static str,
    },

    /// Reading the file for validation failed.
    #[error("IO error validating {path}: {source}")]
    Io {
        /// The validated file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl ValidationError {
    /// Creates a validation IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why one candidate URL was abandoned.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// The metadata probe returned a non-success status.
    #[error(transparent)]
    Metadata(#[from] FetchMetadataError),

    /// Transfer failed after retries were exhausted or a permanent error.
    #[error(transparent)]
    Transfer(#[from] DownloadError),

    /// Transfer completed but the file failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl AttemptError {
    /// Returns true if this is a validation failure.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the attempt stopped because the caller cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Transfer(error) if error.is_cancelled())
    }
}

/// One abandoned candidate URL and its error.
#[derive(Debug)]
pub struct UrlFailure {
    /// The candidate URL as supplied by the caller.
    pub url: String,
    /// Why it was abandoned.
    pub error: AttemptError,
}

/// Every candidate URL failed.
#[derive(Debug, Error)]
pub struct AggregateError {
    /// One entry per attempted URL, in attempt order.
    pub failures: Vec<UrlFailure>,
}

impl AggregateError {
    /// Returns the error recorded for the last attempted URL.
    #[must_use]
    pub fn last(&self) -> Option<&AttemptError> {
        self.failures.last().map(|failure| &failure.error)
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} candidate URLs failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.url, failure.error)?;
        }
        Ok(())
    }
}

/// The error returned by a `download()` call.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The caller cancelled the download.
    #[error("download to {destination} aborted")]
    Aborted {
        /// The destination path.
        destination: PathBuf,
    },

    /// The destination could not be opened or created.
    #[error("cannot open destination {path}: {source}")]
    FileSystem {
        /// The destination path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The request carried no candidate URL.
    #[error("no candidate URLs supplied for {destination}")]
    NoSources {
        /// The destination path.
        destination: PathBuf,
    },

    /// Every candidate URL failed.
    #[error(transparent)]
    AllSourcesFailed(#[from] AggregateError),
}

impl FetchError {
    /// Returns true if the download was cancelled by the caller.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}
