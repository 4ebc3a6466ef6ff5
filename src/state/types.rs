//! Types for the migration state store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::transfer::{AssetKind, AssetRef};

/// Lifecycle of one asset through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    Pending,
    Downloading,
    Downloaded,
    Verified,
    MetadataInjected,
    Uploading,
    Completed,
    FailedTransient,
    FailedPermanent,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 9] = [
        Self::Pending,
        Self::Downloading,
        Self::Downloaded,
        Self::Verified,
        Self::MetadataInjected,
        Self::Uploading,
        Self::Completed,
        Self::FailedTransient,
        Self::FailedPermanent,
    ];

    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Verified => "verified",
            Self::MetadataInjected => "metadata_injected",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::FailedTransient => "failed_transient",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::FailedPermanent)
    }

    /// A step was started but its outcome never recorded.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Downloading
                | Self::Downloaded
                | Self::Verified
                | Self::MetadataInjected
                | Self::Uploading
        )
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure category persisted with a failed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientNetwork,
    ChecksumMismatch,
    MetadataInjection,
    DestinationRejected,
    SourceRejected,
    LocalIo,
    PairedAssetFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::MetadataInjection => "metadata_injection",
            Self::DestinationRejected => "destination_rejected",
            Self::SourceRejected => "source_rejected",
            Self::LocalIo => "local_io",
            Self::PairedAssetFailed => "paired_asset_failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transient_network" => Some(Self::TransientNetwork),
            "checksum_mismatch" => Some(Self::ChecksumMismatch),
            "metadata_injection" => Some(Self::MetadataInjection),
            "destination_rejected" => Some(Self::DestinationRejected),
            "source_rejected" => Some(Self::SourceRejected),
            "local_io" => Some(Self::LocalIo),
            "paired_asset_failed" => Some(Self::PairedAssetFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing pending or retryable remains.
    Done,
    /// Cancelled by the operator; resumable.
    Interrupted,
    /// Stopped early because a server was unreachable; resumable.
    Aborted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Interrupted => "interrupted",
            Self::Aborted => "aborted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "done" => Some(Self::Done),
            "interrupted" => Some(Self::Interrupted),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings captured when a run is created. A resumed run keeps these even
/// if the command line differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub scratch_dir: PathBuf,
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    pub strict_metadata: bool,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            concurrency: 4,
            scratch_dir: std::env::temp_dir().join("media-migrate"),
            max_attempts: 3,
            retry: RetryPolicy::default(),
            strict_metadata: false,
        }
    }
}

/// Durable per-asset progress, keyed by `source_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub source_id: String,
    /// Source album the asset is scheduled under.
    pub album_id: String,
    pub kind: AssetKind,
    pub pair_id: Option<String>,
    pub original_filename: String,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256.
    pub content_hash: Option<String>,
    /// Checksum string exactly as last declared by the source.
    pub declared_checksum: Option<String>,
    pub status: RecordStatus,
    pub attempt_count: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
    pub destination_id: Option<String>,
    pub staged_destination_id: Option<String>,
    pub local_temp_path: Option<PathBuf>,
    pub metadata_warning: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn new_pending(asset: &AssetRef, album_id: &str) -> Self {
        Self {
            source_id: asset.source_id.clone(),
            album_id: album_id.to_string(),
            kind: asset.kind,
            pair_id: asset.pair_id.clone(),
            original_filename: asset.original_filename.clone(),
            size_bytes: asset.size_bytes,
            content_hash: None,
            declared_checksum: asset.declared_checksum.clone(),
            status: RecordStatus::Pending,
            attempt_count: 0,
            last_error_kind: None,
            last_error: None,
            destination_id: None,
            staged_destination_id: None,
            local_temp_path: None,
            metadata_warning: None,
            updated_at: Utc::now(),
        }
    }

    #[cfg(test)]
    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = status;
        self
    }
}

/// The run row.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRun {
    pub run_id: String,
    pub album_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub settings: MigrationSettings,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub failed_transient: u64,
    pub failed_permanent: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: RecordStatus, n: u64) {
        match status {
            RecordStatus::Pending => self.pending += n,
            RecordStatus::Completed => self.completed += n,
            RecordStatus::FailedTransient => self.failed_transient += n,
            RecordStatus::FailedPermanent => self.failed_permanent += n,
            _ => self.in_flight += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.completed + self.failed_transient + self.failed_permanent
    }

    /// Records that a later pass or run could still move forward.
    pub fn unfinished(&self) -> u64 {
        self.pending + self.in_flight + self.failed_transient
    }
}

/// Which permanently failed records an operator reset applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    One(String),
    AllFailed,
}
