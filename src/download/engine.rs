//! Download orchestrator: one logical resource from an ordered list of mirrors.
//!
//! # Overview
//!
//! [`DownloadEngine::download`] takes a [`DownloadRequest`] and:
//!
//! 1. opens the destination read-write (created, never truncated on open)
//! 2. if the file is non-empty, the caller supplied a validator and no
//!    checkpoint or resume plan marks it unfinished, returns at once when the
//!    existing bytes already pass it
//! 3. tries each candidate URL strictly in order: plan (explicit resume,
//!    checkpoint, or metadata probe), transfer all segments in parallel,
//!    fsync, validate
//! 4. on a failed transfer persists a [`Checkpoint`](super::Checkpoint) so a
//!    later call resumes; on success deletes the checkpoints of every
//!    candidate URL
//! 5. when every URL failed, removes the destination if the last failure was a
//!    validation failure and returns [`FetchError::AllSourcesFailed`]
//!
//! Cancellation is checked before every URL and inside every segment task;
//! once observed the call returns [`FetchError::Aborted`] with no further
//! retries or fallbacks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use resumable_fetch::DownloadOptions;
//! use resumable_fetch::download::{
//!     ChecksumValidator, DownloadEngine, DownloadRequest, HashAlgorithm,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DownloadEngine::new(DownloadOptions::default())?;
//! let request = DownloadRequest::new(
//!     [
//!         "https://piston-data.example.net/client.jar",
//!         "https://mirror.example.org/client.jar",
//!     ],
//!     "versions/1.20.1/1.20.1.jar",
//! )
//! .validator(Arc::new(ChecksumValidator::new(
//!     HashAlgorithm::Sha1,
//!     "0c3ec587af28e5a785c0b4a7b8a30f9a8f78f838",
//! )));
//! engine.download(request).await?;
//! # Ok(())
//! # }
//! ```

mod checkpointing;
mod planning;
mod segment_task;

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use self::segment_task::SegmentRun;
use super::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use super::client::HttpClient;
use super::error::{AggregateError, AttemptError, DownloadError, FetchError, UrlFailure};
use super::metadata::{MetadataResolver, ResourceMetadata};
use super::positional;
use super::segment::{Segment, SegmentCursor, remaining_bytes, snapshot_all};
use super::status::{NoopStatus, Progress, StatusController};
use super::validate::{NoopValidator, Validator};
use crate::config::{DownloadOptions, EngineError};

/// Caller-supplied plan for the primary URL.
#[derive(Debug, Clone)]
struct ResumeInput {
    metadata: ResourceMetadata,
    segments: Option<Vec<Segment>>,
}

/// Everything one `download()` call needs.
///
/// Built with chained setters; only the URLs and destination are required.
pub struct DownloadRequest {
    urls: Vec<String>,
    headers: HeaderMap,
    destination: PathBuf,
    resume: Option<ResumeInput>,
    validator: Option<Arc<dyn Validator>>,
    status: Arc<dyn StatusController>,
    cancel: CancellationToken,
}

impl DownloadRequest {
    /// Creates a request for `destination` from ordered candidate URLs (the
    /// first is the primary, the rest are fallback mirrors).
    pub fn new<I, S>(urls: I, destination: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            headers: HeaderMap::new(),
            destination: destination.into(),
            resume: None,
            validator: None,
            status: Arc::new(NoopStatus),
            cancel: CancellationToken::new(),
        }
    }

    /// Adds a header sent with every probe and segment request.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the integrity check run after the transfer (and before it, on a
    /// non-empty destination).
    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Sets the progress receiver.
    #[must_use]
    pub fn status(mut self, status: Arc<dyn StatusController>) -> Self {
        self.status = status;
        self
    }

    /// Sets the cancellation token observed by every request of this call.
    #[must_use]
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resumes the primary URL from known metadata instead of probing it.
    ///
    /// With `segments` the transfer continues exactly where they point (the
    /// destination is not resized). Without them, segments are planned from
    /// `metadata`.
    #[must_use]
    pub fn resume_from(mut self, metadata: ResourceMetadata, segments: Option<Vec<Segment>>) -> Self {
        self.resume = Some(ResumeInput { metadata, segments });
        self
    }

    /// Candidate URLs in attempt order.
    #[must_use]
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Destination path.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

impl fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("urls", &self.urls)
            .field("destination", &self.destination)
            .field("resume", &self.resume.is_some())
            .field("validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

/// Resumable, segmented downloader.
///
/// One engine serves any number of concurrent `download()` calls for
/// different destinations; they share the HTTP connection pool and the
/// checkpoint store.
pub struct DownloadEngine {
    client: HttpClient,
    resolver: MetadataResolver,
    options: DownloadOptions,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl DownloadEngine {
    /// Creates an engine with an in-memory checkpoint store.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if `options` fail validation or the HTTP client
    /// cannot be built.
    #[instrument(level = "debug", skip(options))]
    pub fn new(options: DownloadOptions) -> Result<Self, EngineError> {
        options.validate()?;
        let client = HttpClient::new(&options)?;
        let resolver = MetadataResolver::new(client.clone(), options.retry.clone());

        debug!(
            concurrency = options.concurrency,
            segment_threshold = options.segment_threshold,
            max_attempts = options.retry.max_attempts(),
            "creating download engine"
        );

        Ok(Self {
            client,
            resolver,
            options,
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        })
    }

    /// Replaces the checkpoint store.
    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Downloads one resource.
    ///
    /// Concurrent calls for the same destination are not supported and not
    /// guarded; callers must serialize downloads per destination path.
    ///
    /// # Errors
    ///
    /// - [`FetchError::NoSources`] if the request has no URL
    /// - [`FetchError::FileSystem`] if the destination cannot be opened
    /// - [`FetchError::Aborted`] if the cancellation token fired
    /// - [`FetchError::AllSourcesFailed`] with one entry per attempted URL
    #[instrument(skip(self, request), fields(destination = %request.destination.display(), urls = request.urls.len()))]
    pub async fn download(&self, request: DownloadRequest) -> Result<(), FetchError> {
        let destination = request.destination.clone();
        if request.urls.is_empty() {
            return Err(FetchError::NoSources { destination });
        }

        let file = Arc::new(open_destination(&destination).await?);

        if let Some(validator) = &request.validator
            && !self.transfer_outstanding(&request).await
            && self
                .already_valid(&file, validator.as_ref(), &request)
                .await?
        {
            info!("destination already valid, skipping download");
            return Ok(());
        }

        let validator: Arc<dyn Validator> = request
            .validator
            .clone()
            .unwrap_or_else(|| Arc::new(NoopValidator));
        let mut failures = Vec::new();

        for (index, url) in request.urls.iter().enumerate() {
            if request.cancel.is_cancelled() {
                info!("download aborted");
                return Err(FetchError::Aborted { destination });
            }

            info!(url = %url, candidate = index + 1, "downloading");
            match self
                .attempt(&request, url, index == 0, &file, validator.as_ref())
                .await
            {
                Ok(()) => {
                    info!(url = %url, "download complete");
                    for other in request.urls.iter().filter(|other| *other != url) {
                        checkpointing::discard(self.checkpoints.as_ref(), other, &destination)
                            .await;
                    }
                    return Ok(());
                }
                Err(error) if error.is_cancelled() => {
                    info!(url = %url, "download aborted");
                    return Err(FetchError::Aborted { destination });
                }
                Err(error) => {
                    warn!(url = %url, error = %error, "abandoning candidate URL");
                    failures.push(UrlFailure {
                        url: url.clone(),
                        error,
                    });
                }
            }
        }

        drop(file);
        if failures.last().is_some_and(|failure| failure.error.is_validation()) {
            if let Err(error) = tokio::fs::remove_file(&destination).await {
                warn!(error = %error, "failed to remove destination that failed validation");
            } else {
                debug!("removed destination that failed validation");
            }
        }

        Err(AggregateError { failures }.into())
    }

    /// True when a caller-supplied plan or a stored checkpoint says the
    /// destination still has unwritten ranges.
    async fn transfer_outstanding(&self, request: &DownloadRequest) -> bool {
        if let Some(segments) = request.resume.as_ref().and_then(|r| r.segments.as_deref())
            && remaining_bytes(segments) > 0
        {
            return true;
        }
        for url in &request.urls {
            if checkpointing::load(self.checkpoints.as_ref(), url, &request.destination)
                .await
                .is_some()
            {
                debug!(url = %url, "checkpoint outstanding, not trusting existing bytes");
                return true;
            }
        }
        false
    }

    async fn already_valid(
        &self,
        file: &Arc<File>,
        validator: &dyn Validator,
        request: &DownloadRequest,
    ) -> Result<bool, FetchError> {
        let on_disk = positional::len(Arc::clone(file))
            .await
            .map_err(|source| FetchError::FileSystem {
                path: request.destination.clone(),
                source,
            })?;
        if on_disk == 0 {
            return Ok(false);
        }
        let primary = request.urls.first().map_or("", String::as_str);
        match validator.validate(file, &request.destination, primary).await {
            Ok(()) => Ok(true),
            Err(error) => {
                debug!(error = %error, "existing destination does not validate");
                Ok(false)
            }
        }
    }

    /// Plans, transfers, syncs and validates from one candidate URL.
    async fn attempt(
        &self,
        request: &DownloadRequest,
        source_url: &str,
        primary: bool,
        file: &Arc<File>,
        validator: &dyn Validator,
    ) -> Result<(), AttemptError> {
        let mut plan = self
            .resolve_plan(request, source_url, primary, file)
            .await?;

        let progress = Progress::new(
            Arc::clone(&request.status),
            plan.content_length.unwrap_or(0),
        );
        progress.resync(remaining_bytes(&plan.segments));

        debug!(
            url = %plan.target_url,
            segments = plan.segments.len(),
            ranged = plan.ranged,
            content_length = ?plan.content_length,
            "starting transfer"
        );

        let run = Arc::new(SegmentRun {
            client: self.client.clone(),
            retry: self.options.retry.clone(),
            file: Arc::clone(file),
            destination: request.destination.clone(),
            url: plan.target_url.clone(),
            headers: request.headers.clone(),
            ranged: plan.ranged,
            cursors: plan.segments.iter().copied().map(SegmentCursor::new).collect(),
            progress,
            cancel: request.cancel.clone(),
        });
        let outcome = Arc::clone(&run).run_all().await;
        plan.segments = snapshot_all(&run.cursors);

        if let Err(error) = outcome {
            if !error.is_cancelled()
                && let Some(checkpoint) = plan.checkpoint()
            {
                checkpointing::save(
                    self.checkpoints.as_ref(),
                    source_url,
                    &request.destination,
                    &checkpoint,
                )
                .await;
            }
            return Err(error.into());
        }

        if plan.content_length.is_none() {
            let written = plan.segments.first().map_or(0, |segment| segment.start);
            positional::set_len(Arc::clone(file), written)
                .await
                .map_err(|e| DownloadError::io(request.destination.clone(), e))?;
        }
        positional::sync_all(Arc::clone(file))
            .await
            .map_err(|e| DownloadError::io(request.destination.clone(), e))?;

        let validated = validator
            .validate(file, &request.destination, source_url)
            .await;
        checkpointing::discard(self.checkpoints.as_ref(), source_url, &request.destination).await;
        validated?;
        Ok(())
    }
}

/// Opens the destination for positional IO, creating parent directories.
async fn open_destination(destination: &Path) -> Result<File, FetchError> {
    let fs_error = |source| FetchError::FileSystem {
        path: destination.to_path_buf(),
        source,
    };

    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(fs_error)?;
    }

    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(destination)
        .await
        .map_err(fs_error)?;
    Ok(file.into_std().await)
}
