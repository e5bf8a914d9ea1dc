//! Segment planning for parallel range transfers.
//!
//! A [`Segment`] is the half-open byte range `[start, end)` still to be fetched.
//! `start` is a resumable cursor: it moves upward as bytes land on disk, so a
//! segment with `start >= end` is complete.
//!
//! # Example
//!
//! ```
//! use resumable_fetch::download::plan_segments;
//!
//! let segments = plan_segments(10_000_000, 2_000_000, 4);
//! assert_eq!(segments.len(), 4);
//! assert_eq!(segments[3].end, 10_000_000);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Byte range `[start, end)` of a resource that remains to be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// First byte not yet written.
    pub start: u64,
    /// One past the last byte of the range.
    pub end: u64,
}

impl Segment {
    /// Creates a segment covering `[start, end)`.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Creates a single segment for a resource of unknown length.
    ///
    /// The end is open; the transfer runs until the body ends.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
        }
    }

    /// Returns true if the segment has no end bound.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.end == u64::MAX
    }

    /// Bytes still to be fetched.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Returns true if nothing is left to fetch.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.start >= self.end
    }
}

/// Splits `content_length` bytes into ordered, disjoint segments.
///
/// Lengths up to `threshold` yield one segment. Longer lengths are walked in
/// strides of `max(threshold, ceil(content_length / concurrency))`, and a final
/// remainder shorter than a stride is folded into the previous segment. The
/// result never has more than `concurrency` segments and no segment is shorter
/// than `threshold` unless it is the only one.
#[must_use]
pub fn plan_segments(content_length: u64, threshold: u64, concurrency: usize) -> Vec<Segment> {
    let threshold = threshold.max(1);
    let concurrency = u64::try_from(concurrency.max(1)).unwrap_or(u64::MAX);

    if content_length <= threshold {
        return vec![Segment::new(0, content_length)];
    }

    let part_size = threshold.max(content_length.div_ceil(concurrency));
    let mut segments: Vec<Segment> = Vec::new();
    let mut offset = 0;

    while offset < content_length {
        let end = offset.saturating_add(part_size).min(content_length);
        if end - offset < part_size
            && let Some(previous) = segments.last_mut()
        {
            previous.end = content_length;
            break;
        }
        segments.push(Segment::new(offset, end));
        offset = end;
    }

    segments
}

/// Sum of bytes still to be fetched across `segments`.
#[must_use]
pub fn remaining_bytes(segments: &[Segment]) -> u64 {
    segments
        .iter()
        .filter(|segment| !segment.is_unbounded())
        .map(Segment::remaining)
        .sum()
}

/// Shared, lock-free view of one segment while its task is running.
///
/// The owning task advances `start`; the orchestrator reads snapshots for
/// progress resets and checkpoints.
#[derive(Debug)]
pub(crate) struct SegmentCursor {
    start: AtomicU64,
    end: u64,
}

impl SegmentCursor {
    pub(crate) fn new(segment: Segment) -> Self {
        Self {
            start: AtomicU64::new(segment.start),
            end: segment.end,
        }
    }

    pub(crate) fn snapshot(&self) -> Segment {
        Segment::new(self.start.load(Ordering::SeqCst), self.end)
    }

    pub(crate) fn advance(&self, bytes: u64) {
        self.start.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn rewind(&self, start: u64) {
        self.start.store(start, Ordering::SeqCst);
    }
}

pub(crate) fn snapshot_all(cursors: &[SegmentCursor]) -> Vec<Segment> {
    cursors.iter().map(SegmentCursor::snapshot).collect()
}
