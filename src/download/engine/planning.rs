//! Where the bytes of one attempt come from: explicit resume input, a
//! checkpoint (fresh or revalidated), or a fresh metadata probe.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use super::{DownloadEngine, DownloadRequest, ResumeInput, checkpointing};
use crate::download::cache_policy::CachePolicy;
use crate::download::checkpoint::Checkpoint;
use crate::download::error::{AttemptError, DownloadError, FetchMetadataError};
use crate::download::metadata::{ProbeOutcome, ResourceMetadata};
use crate::download::positional;
use crate::download::segment::{Segment, plan_segments};

/// Segment plan for one candidate URL.
#[derive(Debug, Clone)]
pub(super) struct TransferPlan {
    /// URL the segment requests go to.
    pub(super) target_url: String,
    /// Segments may be fetched with `Range` requests.
    pub(super) ranged: bool,
    pub(super) content_length: Option<u64>,
    pub(super) segments: Vec<Segment>,
    pub(super) policy: CachePolicy,
}

impl TransferPlan {
    fn from_checkpoint(checkpoint: Checkpoint, target_url: String, policy: CachePolicy) -> Self {
        Self {
            target_url,
            ranged: true,
            content_length: Some(checkpoint.content_length),
            segments: checkpoint.segments,
            policy,
        }
    }

    /// Resume record for this plan; only ranged plans of known length can
    /// resume.
    pub(super) fn checkpoint(&self) -> Option<Checkpoint> {
        let content_length = self.content_length?;
        self.ranged.then(|| Checkpoint {
            segments: self.segments.clone(),
            url: self.target_url.clone(),
            content_length,
            cache_policy: self.policy.clone(),
        })
    }
}

impl DownloadEngine {
    pub(super) async fn resolve_plan(
        &self,
        request: &DownloadRequest,
        source_url: &str,
        primary: bool,
        file: &Arc<File>,
    ) -> Result<TransferPlan, AttemptError> {
        if primary && let Some(resume) = &request.resume {
            debug!(url = %source_url, "using caller-supplied resume state");
            return self.plan_from_resume(resume, file, &request.destination).await;
        }

        if let Some(checkpoint) =
            checkpointing::load(self.checkpoints.as_ref(), source_url, &request.destination).await
            && let Some(plan) = self
                .reuse_checkpoint(checkpoint, request, source_url, file)
                .await?
        {
            return Ok(plan);
        }

        match self
            .resolver
            .probe(source_url, &request.headers, None, &request.cancel)
            .await?
        {
            ProbeOutcome::Fresh { metadata, policy } => {
                self.fresh_plan(metadata, policy, file, &request.destination)
                    .await
            }
            ProbeOutcome::NotModified { .. } => Err(FetchMetadataError::new(source_url, 304).into()),
        }
    }

    async fn plan_from_resume(
        &self,
        resume: &ResumeInput,
        file: &Arc<File>,
        destination: &Path,
    ) -> Result<TransferPlan, AttemptError> {
        let metadata = &resume.metadata;
        let policy = CachePolicy::from_metadata(metadata, SystemTime::now());
        match &resume.segments {
            Some(segments) if metadata.supports_segments() => Ok(TransferPlan {
                target_url: metadata.url.clone(),
                ranged: true,
                content_length: metadata.content_length,
                segments: segments.clone(),
                policy,
            }),
            _ => {
                self.fresh_plan(metadata.clone(), policy, file, destination)
                    .await
            }
        }
    }

    /// Returns `None` when the checkpoint cannot be used and a fresh probe is
    /// needed.
    async fn reuse_checkpoint(
        &self,
        checkpoint: Checkpoint,
        request: &DownloadRequest,
        source_url: &str,
        file: &Arc<File>,
    ) -> Result<Option<TransferPlan>, AttemptError> {
        let destination = &request.destination;
        let on_disk = positional::len(Arc::clone(file))
            .await
            .map_err(|e| DownloadError::io(destination, e))?;
        if on_disk != checkpoint.content_length {
            debug!(
                url = %source_url,
                on_disk,
                expected = checkpoint.content_length,
                "destination length differs from checkpoint, discarding"
            );
            checkpointing::discard(self.checkpoints.as_ref(), source_url, destination).await;
            return Ok(None);
        }

        if checkpoint.cache_policy.is_fresh(SystemTime::now()) {
            debug!(url = %source_url, "checkpoint is fresh, skipping metadata probe");
            let policy = checkpoint.cache_policy.clone();
            let target = checkpoint.url.clone();
            return Ok(Some(TransferPlan::from_checkpoint(checkpoint, target, policy)));
        }

        let stored = checkpoint.cache_policy.clone();
        if !stored.can_revalidate() {
            debug!(url = %source_url, "stale checkpoint has no validators, discarding");
            checkpointing::discard(self.checkpoints.as_ref(), source_url, destination).await;
            return Ok(None);
        }
        let outcome = self
            .resolver
            .probe(source_url, &request.headers, Some(&stored), &request.cancel)
            .await?;

        match outcome {
            ProbeOutcome::NotModified { policy } => {
                let target = checkpoint.url.clone();
                Ok(Some(TransferPlan::from_checkpoint(checkpoint, target, policy)))
            }
            ProbeOutcome::Fresh { metadata, policy }
                if metadata.supports_segments()
                    && metadata.content_length == Some(checkpoint.content_length)
                    && policy.same_representation(&stored) =>
            {
                debug!(url = %source_url, "server resent the same representation, resuming");
                Ok(Some(TransferPlan::from_checkpoint(
                    checkpoint,
                    metadata.url,
                    policy,
                )))
            }
            ProbeOutcome::Fresh { metadata, policy } => {
                debug!(url = %source_url, "remote resource changed, replanning");
                checkpointing::discard(self.checkpoints.as_ref(), source_url, destination).await;
                self.fresh_plan(metadata, policy, file, destination)
                    .await
                    .map(Some)
            }
        }
    }

    /// Plans from scratch and resizes the destination to the new length.
    async fn fresh_plan(
        &self,
        metadata: ResourceMetadata,
        policy: CachePolicy,
        file: &Arc<File>,
        destination: &Path,
    ) -> Result<TransferPlan, AttemptError> {
        let (segments, ranged) = match metadata.content_length {
            Some(length) if metadata.accept_ranges => (
                plan_segments(
                    length,
                    self.options.segment_threshold,
                    self.options.concurrency,
                ),
                true,
            ),
            Some(length) => (vec![Segment::new(0, length)], false),
            None => (vec![Segment::unbounded()], false),
        };

        positional::set_len(Arc::clone(file), metadata.content_length.unwrap_or(0))
            .await
            .map_err(|e| DownloadError::io(destination, e))?;

        Ok(TransferPlan {
            target_url: metadata.url,
            ranged,
            content_length: metadata.content_length,
            segments,
            policy,
        })
    }
}
