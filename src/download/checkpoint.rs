//! Resume state for downloads that did not finish.
//!
//! A [`Checkpoint`] records how far each segment got, the URL the bytes came
//! from, and the caching policy that lets a later attempt prove the remote
//! resource is unchanged. Records are keyed by `(source URL, destination)`.
//!
//! Three [`CheckpointStore`] backends are provided:
//! - [`MemoryCheckpointStore`]: concurrent in-process map
//! - [`SqliteCheckpointStore`]: survives process restarts
//! - [`DisabledCheckpointStore`]: never remembers anything
//!
//! Store failures never fail a download; the engine logs them and carries on.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use super::cache_policy::CachePolicy;
use super::segment::Segment;
use crate::db::Database;

/// Persisted progress of one interrupted download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Segments as far as they had advanced.
    pub segments: Vec<Segment>,
    /// URL the segments were fetched from (after redirects).
    pub url: String,
    /// Full length of the resource.
    pub content_length: u64,
    /// Policy captured from the metadata probe.
    pub cache_policy: CachePolicy,
}

/// Checkpoint store failures.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The backing database rejected the operation.
    #[error("checkpoint database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored record could not be (de)serialized.
    #[error("checkpoint record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Key-value store for checkpoints.
///
/// At most one writer per key is expected; the engine only writes a key after
/// the attempt that read it has stopped.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Looks up the checkpoint for `url` and `destination`.
    async fn find(&self, url: &str, destination: &Path)
    -> Result<Option<Checkpoint>, CheckpointError>;

    /// Inserts or replaces the checkpoint for `url` and `destination`.
    async fn put(
        &self,
        url: &str,
        destination: &Path,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError>;

    /// Removes the checkpoint for `url` and `destination`, if any.
    async fn delete(&self, url: &str, destination: &Path) -> Result<(), CheckpointError>;
}

/// In-process checkpoint map.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<(String, PathBuf), Checkpoint>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no checkpoint is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn memory_key(url: &str, destination: &Path) -> (String, PathBuf) {
    (url.to_string(), destination.to_path_buf())
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn find(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .entries
            .get(&memory_key(url, destination))
            .map(|entry| entry.value().clone()))
    }

    async fn put(
        &self,
        url: &str,
        destination: &Path,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        self.entries
            .insert(memory_key(url, destination), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, url: &str, destination: &Path) -> Result<(), CheckpointError> {
        self.entries.remove(&memory_key(url, destination));
        Ok(())
    }
}

/// Checkpoints stored as JSON rows in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    db: Database,
}

impl SqliteCheckpointStore {
    /// Creates a store on an opened database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Number of stored checkpoints.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Database`] if the query fails.
    pub async fn count(&self) -> Result<i64, CheckpointError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM checkpoints")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    #[instrument(level = "debug", skip(self), fields(destination = %destination.display()))]
    async fn find(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM checkpoints WHERE url = ? AND destination = ?")
                .bind(url)
                .bind(destination.to_string_lossy().as_ref())
                .fetch_optional(self.db.pool())
                .await?;

        match row {
            Some((payload,)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    #[instrument(level = "debug", skip(self, checkpoint), fields(destination = %destination.display()))]
    async fn put(
        &self,
        url: &str,
        destination: &Path,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        let payload = serde_json::to_string(checkpoint)?;
        sqlx::query(
            r"INSERT INTO checkpoints (url, destination, payload, updated_at)
              VALUES (?, ?, ?, datetime('now'))
              ON CONFLICT(url, destination)
              DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(url)
        .bind(destination.to_string_lossy().as_ref())
        .bind(payload)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(destination = %destination.display()))]
    async fn delete(&self, url: &str, destination: &Path) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM checkpoints WHERE url = ? AND destination = ?")
            .bind(url)
            .bind(destination.to_string_lossy().as_ref())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

/// Store that keeps nothing; every download starts from a fresh probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCheckpointStore;

#[async_trait]
impl CheckpointStore for DisabledCheckpointStore {
    async fn find(
        &self,
        _url: &str,
        _destination: &Path,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(None)
    }

    async fn put(
        &self,
        _url: &str,
        _destination: &Path,
        _checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn delete(&self, _url: &str, _destination: &Path) -> Result<(), CheckpointError> {
        Ok(())
    }
}
