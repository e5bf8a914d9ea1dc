//! Defaults for the download engine (segmenting, timeouts, retry backoff).

use std::time::Duration;

/// Smallest segment worth its own range request (2 MiB).
pub const DEFAULT_SEGMENT_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Default number of parallel segment transfers per download.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Upper bound accepted for the concurrency setting.
pub const MAX_CONCURRENCY: usize = 64;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default wait for response headers once connected (30 seconds).
pub const HEADER_TIMEOUT_SECS: u64 = 30;

/// Default body inactivity timeout between chunks (60 seconds).
pub const READ_TIMEOUT_SECS: u64 = 60;

/// Linear backoff step: the n-th retry waits `n * RETRY_BASE_DELAY`.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Heuristic freshness is this fraction of the time since `Last-Modified`.
pub const HEURISTIC_FRESHNESS_DIVISOR: u64 = 10;

/// Cap on heuristic freshness (one day).
pub const MAX_HEURISTIC_FRESHNESS: Duration = Duration::from_secs(24 * 60 * 60);
