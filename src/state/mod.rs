//! Migration state store.
//!
//! One SQLite file per run holds a record per source asset, the source to
//! destination album mapping, and album membership. It is the only ground
//! truth for what has been migrated:
//! - resume after crash or cancellation
//! - idempotent re-runs
//! - attempt ceilings for retryable failures
//! - status reporting and operator resets

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{SqliteStateStore, StateStore};
pub use error::StateError;
pub use types::{
    ErrorKind, MigrationRecord, MigrationRun, MigrationSettings, RecordStatus, ResetScope,
    RunOutcome, StatusCounts,
};
