//! Error types for the migration state store.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("Database query failed: {0}")]
    Query(String),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// Integrity check failed or a row holds values this build cannot
    /// interpret. Never repaired automatically.
    #[error("State database {path} is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("No migration run '{run_id}' in {dir}")]
    RunNotFound { run_id: String, dir: PathBuf },

    #[error("Invalid run id '{0}': use letters, digits, '-', '_' or '.'")]
    InvalidRunId(String),

    #[error("Migration run '{0}' already exists")]
    RunExists(String),

    /// Another process holds the run's lock file.
    #[error("Migration run is in use by another process (lock file {0})")]
    Locked(PathBuf),

    #[error("Failed to access lock file {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StateError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
