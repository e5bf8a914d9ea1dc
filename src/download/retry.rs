//! Retry logic with linear backoff for transient transfer failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types for
//! classifying transfer errors and determining retry behavior.
//!
//! # Overview
//!
//! When a request attempt fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - timeouts, resets and socket errors; retried in place
//! - [`FailureType::Permanent`] - HTTP errors, IO errors, bad URLs; the URL is abandoned
//! - [`FailureType::Cancelled`] - the caller aborted; never retried
//!
//! The [`RetryPolicy`] then decides whether to retry based on failure type
//! and attempt count. The delay grows linearly: attempt `n` waits `n * base_delay`.
//!
//! # Example
//!
//! ```
//! use resumable_fetch::download::{
//!     DownloadError, FailureType, RetryDecision, RetryPolicy, TimeoutPhase, classify_error,
//! };
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::timeout("https://example.com/client.jar", TimeoutPhase::Body);
//! assert_eq!(classify_error(&error), FailureType::Transient);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::error::Error as _;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;

/// Default maximum attempts per segment and URL.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default linear backoff step (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Classification of transfer failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: connect/header/body timeout, connection reset, broken pipe.
    Transient,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: HTTP 4xx/5xx on a transfer, IO errors, invalid URL.
    Permanent,

    /// The shared cancellation signal fired.
    Cancelled,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with linear backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 1 second
/// - `max_jitter`: none
///
/// # Delay Calculation
///
/// ```text
/// delay = base_delay * attempt + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Backoff step multiplied by the failed attempt number.
    base_delay: Duration,

    /// Upper bound of random jitter added to each delay.
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (zero is rejected by
    ///   [`DownloadOptions::validate`](crate::DownloadOptions::validate))
    /// * `base_delay` - Linear backoff step
    /// * `max_jitter` - Upper bound of random jitter added to each delay
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_jitter,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the linear backoff step.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Determines whether to retry a failed attempt.
    ///
    /// # Arguments
    ///
    /// * `failure_type` - Classification of the failure
    /// * `attempt` - The attempt number that just failed (1-indexed)
    #[instrument(level = "trace", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::Cancelled => {
                return RetryDecision::DoNotRetry {
                    reason: "cancelled by caller".to_string(),
                };
            }
            FailureType::Transient => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Classifies `error` and decides whether attempt `attempt` against `url`
    /// should be retried.
    pub fn decide(&self, url: &str, attempt: u32, error: &DownloadError) -> RetryDecision {
        let decision = self.should_retry(classify_error(error), attempt);
        match &decision {
            RetryDecision::Retry { delay, attempt } => debug!(
                url = %url,
                next_attempt = attempt,
                delay_ms = delay.as_millis(),
                error = %error,
                "will retry"
            ),
            RetryDecision::DoNotRetry { reason } => debug!(
                url = %url,
                %reason,
                error = %error,
                "not retrying"
            ),
        }
        decision
    }

    /// Delay before retrying after attempt `attempt` failed.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt) + self.calculate_jitter()
    }

    fn calculate_jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }
}

/// Classifies a transfer error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | Timeout (connect, headers, body) | Transient |
/// | ConnectionReset, Truncated | Transient |
/// | Network (non-TLS) | Transient |
/// | Network (TLS/certificate) | Permanent |
/// | HttpStatus, RangeNotHonored | Permanent |
/// | Io, InvalidUrl, TaskFailed | Permanent |
/// | Cancelled | Cancelled |
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::Timeout { .. }
        | DownloadError::ConnectionReset { .. }
        | DownloadError::Truncated { .. } => FailureType::Transient,

        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }

        DownloadError::HttpStatus { .. }
        | DownloadError::RangeNotHonored { .. }
        | DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::TaskFailed { .. } => FailureType::Permanent,

        DownloadError::Cancelled { .. } => FailureType::Cancelled,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let mut message = error.to_string().to_lowercase();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push(' ');
        message.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    message.contains("certificate")
        || message.contains("tls")
        || message.contains("ssl")
        || message.contains("handshake")
}
