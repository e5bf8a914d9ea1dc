//! SQLite connection backing the persistent checkpoint store.
//!
//! Opening a [`Database`] creates the file when missing, switches it to WAL so
//! several `rfetch` processes can read checkpoints while one writes, and
//! applies the bundled migrations.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use resumable_fetch::{Database, DownloadEngine, DownloadOptions, SqliteCheckpointStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("checkpoints.db")).await?;
//! let engine = DownloadEngine::new(DownloadOptions::default())?
//!     .with_checkpoint_store(Arc::new(SqliteCheckpointStore::new(db)));
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// Checkpoint traffic is a handful of rows per download; a small pool is enough.
const MAX_CONNECTIONS: u32 = 4;

/// How long a connection waits on a locked database before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Opening or querying the database failed.
    #[error("failed to open checkpoint database: {0}")]
    Connection(#[from] sqlx::Error),

    /// The schema could not be brought up to date.
    #[error("failed to migrate checkpoint database: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Pooled SQLite connection with migrations applied.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (or creates) the checkpoint database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the file cannot be opened and
    /// [`DbError::Migration`] if the schema cannot be applied.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn new(path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        Self::migrated(pool).await
    }

    /// Creates an in-memory database; checkpoints vanish with the pool.
    ///
    /// A single connection keeps every query on the same memory database.
    ///
    /// # Errors
    ///
    /// See [`Database::new`].
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("checkpoint schema up to date");
        Ok(Self { pool })
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current journal mode as SQLite reports it (`wal`, `memory`, ...).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the pragma query fails.
    pub async fn journal_mode(&self) -> Result<String, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.to_ascii_lowercase())
    }
}
