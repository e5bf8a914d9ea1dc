//! Progress reporting for one download.
//!
//! The orchestrator reports through the [`StatusController`] contract:
//! - `reset(progress, total)` whenever the segment plan changes (start of an
//!   attempt, a segment restarting after an error)
//! - `on_progress(url, chunk, cumulative)` after every chunk lands on disk
//!
//! [`ProgressAggregate`] is the stock implementation: two atomic counters that
//! any number of segment tasks can update concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives progress updates for one download.
///
/// Implementations are shared across segment tasks and must tolerate
/// concurrent calls.
pub trait StatusController: Send + Sync {
    /// Re-bases progress: `progress` bytes of `total` are already on disk.
    ///
    /// `total` is 0 when the content length is unknown.
    fn reset(&self, progress: u64, total: u64);

    /// `chunk_size` more bytes from `url` were written; `progress` is the new
    /// cumulative byte count.
    fn on_progress(&self, url: &str, chunk_size: u64, progress: u64);
}

/// Lock-free progress counters.
#[derive(Debug, Default)]
pub struct ProgressAggregate {
    progress: AtomicU64,
    total: AtomicU64,
}

impl ProgressAggregate {
    /// Creates an aggregate with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    #[must_use]
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Expected total, or 0 if unknown.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

impl StatusController for ProgressAggregate {
    fn reset(&self, progress: u64, total: u64) {
        self.total.store(total, Ordering::SeqCst);
        self.progress.store(progress, Ordering::SeqCst);
    }

    fn on_progress(&self, _url: &str, _chunk_size: u64, progress: u64) {
        self.progress.fetch_max(progress, Ordering::SeqCst);
    }
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatus;

impl StatusController for NoopStatus {
    fn reset(&self, _progress: u64, _total: u64) {}

    fn on_progress(&self, _url: &str, _chunk_size: u64, _progress: u64) {}
}

/// Byte counter shared by the segment tasks of one attempt.
///
/// Forwards every change to the caller's controller so the reported
/// cumulative value always comes from a single atomic.
pub(crate) struct Progress {
    written: AtomicU64,
    total: u64,
    controller: Arc<dyn StatusController>,
}

impl Progress {
    pub(crate) fn new(controller: Arc<dyn StatusController>, total: u64) -> Self {
        Self {
            written: AtomicU64::new(0),
            total,
            controller,
        }
    }

    /// Re-bases from the bytes still missing across all segments.
    pub(crate) fn resync(&self, remaining: u64) {
        let done = self.total.saturating_sub(remaining);
        self.written.store(done, Ordering::SeqCst);
        self.controller.reset(done, self.total);
    }

    pub(crate) fn record(&self, url: &str, chunk_size: u64) {
        let cumulative = self.written.fetch_add(chunk_size, Ordering::SeqCst) + chunk_size;
        self.controller.on_progress(url, chunk_size, cumulative);
    }
}
