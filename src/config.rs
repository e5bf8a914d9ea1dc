//! Engine configuration.
//!
//! [`DownloadOptions`] carries every tunable of a [`DownloadEngine`]; there is
//! no global state. Defaults match the constants in
//! [`download::constants`](crate::download::constants).
//!
//! [`DownloadEngine`]: crate::download::DownloadEngine

use std::time::Duration;

use thiserror::Error;

use crate::download::RetryPolicy;
use crate::download::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_CONCURRENCY, DEFAULT_SEGMENT_THRESHOLD, HEADER_TIMEOUT_SECS,
    MAX_CONCURRENCY, READ_TIMEOUT_SECS,
};
use crate::user_agent;

/// Invalid engine configuration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Concurrency outside `1..=64`.
    #[error("concurrency must be between 1 and {max}, got {value}")]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
        /// Largest accepted value.
        max: usize,
    },

    /// Segment threshold of zero.
    #[error("segment threshold must be greater than zero")]
    InvalidThreshold,

    /// Retry policy allowing zero attempts.
    #[error("retry policy must allow at least one attempt, got {value}")]
    InvalidRetryCount {
        /// The rejected value.
        value: u32,
    },

    /// The HTTP client could not be built from the options.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Tunables for one [`DownloadEngine`](crate::download::DownloadEngine).
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Smallest length worth splitting into its own segment.
    pub segment_threshold: u64,
    /// Parallel segment transfers per download.
    pub concurrency: usize,
    /// Retry policy applied to each segment and to metadata probes.
    pub retry: RetryPolicy,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Wait for response headers after the request is sent.
    pub header_timeout: Duration,
    /// Longest allowed silence while streaming a body.
    pub read_timeout: Duration,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            segment_threshold: DEFAULT_SEGMENT_THRESHOLD,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            header_timeout: Duration::from_secs(HEADER_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            user_agent: user_agent::default_download_user_agent(),
        }
    }
}

impl DownloadOptions {
    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns the first [`EngineError`] found.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(EngineError::InvalidConcurrency {
                value: self.concurrency,
                max: MAX_CONCURRENCY,
            });
        }
        if self.segment_threshold == 0 {
            return Err(EngineError::InvalidThreshold);
        }
        if self.retry.max_attempts() == 0 {
            return Err(EngineError::InvalidRetryCount {
                value: self.retry.max_attempts(),
            });
        }
        Ok(())
    }
}
