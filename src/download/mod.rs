//! Resumable, segmented HTTP download engine.
//!
//! # Features
//!
//! - Parallel `Range` transfers into one shared file via positional writes
//! - Ordered mirror fallback with per-URL error aggregation
//! - Linear-backoff retry of transient failures (timeouts, resets)
//! - Checkpoints with HTTP cache revalidation for resume across restarts
//! - Pluggable integrity validation (checksums, zip structure)
//! - Cooperative cancellation through one shared token
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use resumable_fetch::DownloadOptions;
//! use resumable_fetch::download::{DownloadEngine, DownloadRequest, ProgressAggregate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DownloadEngine::new(DownloadOptions::default())?;
//! let progress = Arc::new(ProgressAggregate::new());
//! engine
//!     .download(
//!         DownloadRequest::new(["https://example.com/assets/index.json"], "assets/index.json")
//!             .status(progress.clone()),
//!     )
//!     .await?;
//! println!("{} of {} bytes", progress.progress(), progress.total());
//! # Ok(())
//! # }
//! ```

pub mod cache_policy;
pub mod checkpoint;
mod client;
pub mod constants;
mod engine;
mod error;
pub mod metadata;
mod positional;
mod retry;
pub mod segment;
pub mod status;
pub mod validate;

pub use cache_policy::CachePolicy;
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, DisabledCheckpointStore, MemoryCheckpointStore,
    SqliteCheckpointStore,
};
pub use client::HttpClient;
pub use engine::{DownloadEngine, DownloadRequest};
pub use error::{
    AggregateError, AttemptError, DownloadError, FetchError, FetchMetadataError,
    MetadataErrorKind, TimeoutPhase, UrlFailure, ValidationError,
};
pub use metadata::{MetadataResolver, ProbeOutcome, ResourceMetadata};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use segment::{Segment, plan_segments, remaining_bytes};
pub use status::{NoopStatus, ProgressAggregate, StatusController};
pub use validate::{
    ArchiveValidator, ChecksumValidator, HashAlgorithm, NoopValidator, Validator, ValidatorChain,
    file_digest,
};
