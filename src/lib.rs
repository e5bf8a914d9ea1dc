//! Resumable, segmented HTTP downloads for large sets of remote files.
//!
//! One call downloads one logical resource from an ordered list of candidate
//! URLs into a destination path, splitting large bodies into parallel range
//! requests, resuming from checkpoints, retrying transient failures, and
//! validating the result.
//!
//! # Architecture
//!
//! - [`download`] - the engine: segment planning, metadata probing, transfer,
//!   retry, validation, checkpoints, progress
//! - [`config`] - [`DownloadOptions`] and their validation
//! - [`db`] - SQLite connection backing the persistent checkpoint store

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
#[cfg(test)]
pub mod test_support;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use config::{DownloadOptions, EngineError};
pub use db::{Database, DbError};
pub use download::{
    DownloadEngine, DownloadRequest, FetchError, ProgressAggregate, RetryPolicy,
    SqliteCheckpointStore,
};
