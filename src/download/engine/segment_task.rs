//! Parallel segment transfers for one attempt.
//!
//! Every incomplete segment gets its own task on a [`JoinSet`]. Tasks share
//! the destination handle (positional writes, disjoint ranges), the progress
//! counter, and one cancellation token. Each task retries its own transient
//! failures in place; the set is drained completely before the result is
//! reported.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use reqwest::{Method, StatusCode};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::download::client::{HttpClient, map_request_error};
use crate::download::error::{DownloadError, TimeoutPhase};
use crate::download::positional;
use crate::download::retry::{RetryDecision, RetryPolicy};
use crate::download::segment::{Segment, SegmentCursor, remaining_bytes, snapshot_all};
use crate::download::status::Progress;

/// Shared state of the segment tasks of one attempt.
pub(super) struct SegmentRun {
    pub(super) client: HttpClient,
    pub(super) retry: RetryPolicy,
    pub(super) file: Arc<File>,
    pub(super) destination: PathBuf,
    pub(super) url: String,
    pub(super) headers: HeaderMap,
    pub(super) ranged: bool,
    pub(super) cursors: Vec<SegmentCursor>,
    pub(super) progress: Progress,
    pub(super) cancel: CancellationToken,
}

impl SegmentRun {
    /// Runs every incomplete segment and waits for all of them.
    ///
    /// A cancellation error wins over any other failure; otherwise the first
    /// failure observed is returned.
    pub(super) async fn run_all(self: Arc<Self>) -> Result<(), DownloadError> {
        let mut tasks = JoinSet::new();
        for index in 0..self.cursors.len() {
            if self.cursors[index].snapshot().is_complete() {
                continue;
            }
            let run = Arc::clone(&self);
            tasks.spawn(async move { run.run_segment(index).await });
        }

        let mut cancelled = None;
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(DownloadError::TaskFailed {
                    reason: e.to_string(),
                })
            });
            match result {
                Ok(()) => {}
                Err(error) if error.is_cancelled() => {
                    cancelled.get_or_insert(error);
                }
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        match cancelled.or(first_error) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn run_segment(&self, index: usize) -> Result<(), DownloadError> {
        let cursor = &self.cursors[index];
        let origin = cursor.snapshot().start;
        let mut attempt = 1;

        loop {
            let error = match self.transfer_once(index).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => error,
            };

            match self.retry.decide(&self.url, attempt, &error) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    if !self.ranged {
                        // Without ranges the retry refetches the whole body.
                        cursor.rewind(origin);
                    }
                    self.progress
                        .resync(remaining_bytes(&snapshot_all(&self.cursors)));
                    debug!(
                        url = %self.url,
                        segment = index,
                        attempt = next,
                        delay_ms = delay.as_millis(),
                        "retrying segment"
                    );
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Err(DownloadError::cancelled(&self.url)),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { .. } => return Err(error),
            }
        }
    }

    /// One GET for what remains of segment `index`.
    async fn transfer_once(&self, index: usize) -> Result<(), DownloadError> {
        let cursor = &self.cursors[index];
        let segment = cursor.snapshot();
        if segment.is_complete() {
            return Ok(());
        }

        let mut headers = self.headers.clone();
        let send_range = self.ranged && !(segment.start == 0 && self.cursors.len() == 1);
        if send_range {
            headers.insert(RANGE, range_header(segment));
        }

        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(DownloadError::cancelled(&self.url)),
            result = self.client.send(Method::GET, &self.url, &headers) => result?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(&self.url, status.as_u16()));
        }
        if send_range && status != StatusCode::PARTIAL_CONTENT && segment.start > 0 {
            return Err(DownloadError::range_not_honored(&self.url, segment.start));
        }

        let expected = segment.remaining();
        let mut offset = segment.start;
        let mut received = 0u64;
        let mut body = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(DownloadError::cancelled(&self.url)),
                next = body.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| map_request_error(&self.url, e, TimeoutPhase::Body))?;

            // A 200 reply to a range at 0 carries the whole entity; keep only our share.
            let wanted = segment.end - offset;
            let take = usize::try_from(wanted).map_or(chunk.len(), |w| w.min(chunk.len()));
            if take == 0 {
                continue;
            }

            positional::write_all_at(Arc::clone(&self.file), offset, chunk.slice(..take))
                .await
                .map_err(|e| DownloadError::io(self.destination.clone(), e))?;

            let written = take as u64;
            offset += written;
            received += written;
            cursor.advance(written);
            self.progress.record(&self.url, written);

            if offset >= segment.end {
                return Ok(());
            }
        }

        if segment.is_unbounded() {
            Ok(())
        } else {
            Err(DownloadError::truncated(&self.url, expected, received))
        }
    }
}

/// Inclusive `Range` header for the rest of `segment`.
fn range_header(segment: Segment) -> HeaderValue {
    let value = if segment.is_unbounded() {
        format!("bytes={}-", segment.start)
    } else {
        format!("bytes={}-{}", segment.start, segment.end - 1)
    };
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("bytes=0-"))
}
