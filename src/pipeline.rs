//! Batch scheduler: runs the per-asset pipeline
//! (download → verify → inject → upload → record) over one batch of work
//! units with bounded concurrency.
//!
//! Every status transition is written to the state store before the next
//! step starts, so a crash at any point leaves a record that reconciliation
//! can reset and retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::checksum::{self, ChecksumError, ContentHash, DeclaredDigest};
use crate::metadata::{self, CaptureMetadata};
use crate::progress::{EventSink, ProgressEvent};
use crate::retry::{retry_with_backoff, RetryAction};
use crate::state::{
    ErrorKind, MigrationRecord, MigrationSettings, RecordStatus, StateError, StateStore,
};
use crate::transfer::{AssetKind, MediaServer, TransferError, UploadRequest};

/// Smallest schedulable unit. A live-photo pair is never split.
#[derive(Debug, Clone)]
pub enum WorkUnit {
    Single(MigrationRecord),
    Pair {
        photo: MigrationRecord,
        video: MigrationRecord,
    },
}

impl WorkUnit {
    pub fn asset_count(&self) -> usize {
        match self {
            WorkUnit::Single(_) => 1,
            WorkUnit::Pair { .. } => 2,
        }
    }

    fn first_id(&self) -> &str {
        match self {
            WorkUnit::Single(r) => &r.source_id,
            WorkUnit::Pair { photo, video } => photo.source_id.as_str().min(video.source_id.as_str()),
        }
    }
}

/// Group queueable records into work units and pack them into batches.
///
/// Records sharing a `pair_id` become one unit when exactly one photo and one
/// video are present; anything else runs as singles. Units are ordered by
/// their smallest `source_id`, and a batch closes when the next unit would
/// push it past `batch_size`. A pair larger than the batch size gets a batch
/// of its own.
pub fn plan_batches(records: Vec<MigrationRecord>, batch_size: usize) -> Vec<Vec<WorkUnit>> {
    let batch_size = batch_size.max(1);
    let mut by_pair: std::collections::BTreeMap<String, Vec<MigrationRecord>> =
        std::collections::BTreeMap::new();
    let mut units = Vec::new();

    for record in records {
        match record.pair_id.clone() {
            Some(pair_id) => by_pair.entry(pair_id).or_default().push(record),
            None => units.push(WorkUnit::Single(record)),
        }
    }

    for (_, mut members) in by_pair {
        let photo_idx = members.iter().position(|r| r.kind == AssetKind::Photo);
        let video_idx = members.iter().position(|r| r.kind == AssetKind::Video);
        match (members.len(), photo_idx, video_idx) {
            (2, Some(p), Some(v)) => {
                let (photo, video) = if p < v {
                    let video = members.remove(v);
                    (members.remove(p), video)
                } else {
                    let photo = members.remove(p);
                    (photo, members.remove(v))
                };
                units.push(WorkUnit::Pair { photo, video });
            }
            _ => units.extend(members.into_iter().map(WorkUnit::Single)),
        }
    }

    units.sort_by(|a, b| a.first_id().cmp(b.first_id()));

    let mut batches: Vec<Vec<WorkUnit>> = Vec::new();
    let mut current: Vec<WorkUnit> = Vec::new();
    let mut current_len = 0;
    for unit in units {
        if !current.is_empty() && current_len + unit.asset_count() > batch_size {
            batches.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += unit.asset_count();
        current.push(unit);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Per-asset tally for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub units: usize,
    pub completed: usize,
    pub failed_transient: usize,
    pub failed_permanent: usize,
    /// Assets left mid-pipeline or never started because of cancellation.
    pub cancelled: usize,
    /// Every unit in the batch failed transiently while talking to the
    /// destination.
    pub destination_unreachable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Source,
    Local,
    Destination,
}

#[derive(Debug, Clone)]
struct Failure {
    kind: ErrorKind,
    message: String,
    transient: bool,
    side: Side,
}

impl Failure {
    fn download(e: &TransferError) -> Self {
        let kind = if e.is_transient() {
            ErrorKind::TransientNetwork
        } else if e.is_local() {
            ErrorKind::LocalIo
        } else {
            ErrorKind::SourceRejected
        };
        Self {
            kind,
            message: e.to_string(),
            transient: e.is_transient(),
            side: if e.is_local() { Side::Local } else { Side::Source },
        }
    }

    fn upload(e: &TransferError) -> Self {
        let kind = if e.is_transient() {
            ErrorKind::TransientNetwork
        } else if e.is_local() {
            ErrorKind::LocalIo
        } else {
            ErrorKind::DestinationRejected
        };
        Self {
            kind,
            message: e.to_string(),
            transient: e.is_transient(),
            side: if e.is_local() {
                Side::Local
            } else {
                Side::Destination
            },
        }
    }

    fn local(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            transient: false,
            side: Side::Local,
        }
    }
}

/// Result of one pipeline step.
enum Step<T> {
    Done(T),
    Failed(Failure),
    Cancelled,
}

#[derive(Debug)]
enum UnitOutcome {
    Completed,
    Failed {
        permanent: bool,
        destination_transient: bool,
    },
    Cancelled,
}

struct Fetched {
    path: PathBuf,
    capture_metadata: CaptureMetadata,
}

/// Runs batches against one source, one destination and one state store.
pub struct BatchScheduler {
    source: Arc<dyn MediaServer>,
    destination: Arc<dyn MediaServer>,
    store: Arc<dyn StateStore>,
    settings: MigrationSettings,
    run_id: String,
    events: EventSink,
    cancel: CancellationToken,
}

impl BatchScheduler {
    pub fn new(
        source: Arc<dyn MediaServer>,
        destination: Arc<dyn MediaServer>,
        store: Arc<dyn StateStore>,
        settings: MigrationSettings,
        run_id: String,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            destination,
            store,
            settings,
            run_id,
            events,
            cancel,
        }
    }

    /// Process one batch. Per-asset failures are recorded and counted; only a
    /// state store failure ends the batch early.
    pub async fn run(&self, batch: Vec<WorkUnit>) -> Result<BatchReport, StateError> {
        let mut report = BatchReport {
            units: batch.len(),
            ..Default::default()
        };
        let total_assets: usize = batch.iter().map(WorkUnit::asset_count).sum();
        let concurrency = self.settings.concurrency.max(1);
        let cancel = self.cancel.clone();

        let results: Vec<Result<(UnitOutcome, usize), StateError>> = stream::iter(batch)
            .take_while(|_| std::future::ready(!cancel.is_cancelled()))
            .map(|unit| async move {
                let assets = unit.asset_count();
                let outcome = match unit {
                    WorkUnit::Single(record) => self.process_single(record).await?,
                    WorkUnit::Pair { photo, video } => self.process_pair(photo, video).await?,
                };
                Ok::<_, StateError>((outcome, assets))
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut processed_assets = 0;
        let mut destination_down_units = 0;
        for result in results {
            let (outcome, assets) = result?;
            processed_assets += assets;
            match outcome {
                UnitOutcome::Completed => report.completed += assets,
                UnitOutcome::Failed {
                    permanent,
                    destination_transient,
                } => {
                    if permanent {
                        report.failed_permanent += assets;
                    } else {
                        report.failed_transient += assets;
                    }
                    if destination_transient {
                        destination_down_units += 1;
                    }
                }
                UnitOutcome::Cancelled => report.cancelled += assets,
            }
        }
        report.cancelled += total_assets - processed_assets;
        report.destination_unreachable =
            report.units > 0 && destination_down_units == report.units;
        Ok(report)
    }

    async fn process_single(&self, mut record: MigrationRecord) -> Result<UnitOutcome, StateError> {
        let fetched = match self.fetch(&mut record).await? {
            Step::Done(fetched) => fetched,
            Step::Failed(failure) => return self.fail_single(record, failure).await,
            Step::Cancelled => return Ok(UnitOutcome::Cancelled),
        };
        if self.cancel.is_cancelled() {
            return Ok(UnitOutcome::Cancelled);
        }

        record.status = RecordStatus::Uploading;
        self.save(&mut record).await?;
        let request = UploadRequest {
            source_id: record.source_id.clone(),
            filename: record.original_filename.clone(),
            capture_metadata: fetched.capture_metadata,
            live_photo_video_id: None,
        };
        match self.upload(&fetched.path, &request).await {
            Ok(destination_id) => {
                tracing::debug!(
                    source_id = %record.source_id,
                    destination_id = %destination_id,
                    "Uploaded"
                );
                record.status = RecordStatus::Completed;
                record.destination_id = Some(destination_id);
                self.cleanup(&mut record).await;
                self.save(&mut record).await?;
                Ok(UnitOutcome::Completed)
            }
            Err(e) => self.fail_single(record, Failure::upload(&e)).await,
        }
    }

    async fn process_pair(
        &self,
        mut photo: MigrationRecord,
        mut video: MigrationRecord,
    ) -> Result<UnitOutcome, StateError> {
        let video_staged = video.staged_destination_id.is_some();
        let (photo_step, video_step) = tokio::join!(self.fetch(&mut photo), async {
            if video_staged {
                Ok(Step::Done(None))
            } else {
                self.fetch(&mut video).await.map(|step| match step {
                    Step::Done(f) => Step::Done(Some(f)),
                    Step::Failed(f) => Step::Failed(f),
                    Step::Cancelled => Step::Cancelled,
                })
            }
        });
        let (photo_step, video_step) = (photo_step?, video_step?);

        let (photo_fetched, video_fetched) = match (photo_step, video_step) {
            (Step::Done(p), Step::Done(v)) => (p, v),
            (Step::Failed(f), other) => {
                let video_failure = match other {
                    Step::Failed(vf) => Some(vf),
                    _ => None,
                };
                return self.fail_pair(photo, video, Some(f), video_failure).await;
            }
            (_, Step::Failed(f)) => return self.fail_pair(photo, video, None, Some(f)).await,
            _ => return Ok(UnitOutcome::Cancelled),
        };
        if self.cancel.is_cancelled() {
            return Ok(UnitOutcome::Cancelled);
        }

        photo.status = RecordStatus::Uploading;
        video.status = RecordStatus::Uploading;
        self.save_many(&mut [&mut photo, &mut video]).await?;

        let video_id = match (video.staged_destination_id.clone(), video_fetched) {
            (Some(staged), _) => {
                tracing::debug!(
                    source_id = %video.source_id,
                    destination_id = %staged,
                    "Reusing staged live photo video"
                );
                staged
            }
            (None, Some(fetched)) => {
                let request = UploadRequest {
                    source_id: video.source_id.clone(),
                    filename: video.original_filename.clone(),
                    capture_metadata: fetched.capture_metadata,
                    live_photo_video_id: None,
                };
                match self.upload(&fetched.path, &request).await {
                    Ok(id) => {
                        video.staged_destination_id = Some(id.clone());
                        self.save(&mut video).await?;
                        id
                    }
                    Err(e) => {
                        return self
                            .fail_pair(photo, video, None, Some(Failure::upload(&e)))
                            .await
                    }
                }
            }
            (None, None) => {
                let failure = Failure::local(ErrorKind::LocalIo, "live photo video was not fetched");
                return self.fail_pair(photo, video, None, Some(failure)).await;
            }
        };
        if self.cancel.is_cancelled() {
            return Ok(UnitOutcome::Cancelled);
        }

        let request = UploadRequest {
            source_id: photo.source_id.clone(),
            filename: photo.original_filename.clone(),
            capture_metadata: photo_fetched.capture_metadata,
            live_photo_video_id: Some(video_id.clone()),
        };
        match self.upload(&photo_fetched.path, &request).await {
            Ok(photo_id) => {
                tracing::debug!(
                    source_id = %photo.source_id,
                    destination_id = %photo_id,
                    video_destination_id = %video_id,
                    "Uploaded live photo pair"
                );
                photo.status = RecordStatus::Completed;
                photo.destination_id = Some(photo_id);
                video.status = RecordStatus::Completed;
                video.destination_id = Some(video_id);
                self.cleanup(&mut photo).await;
                self.cleanup(&mut video).await;
                self.save_many(&mut [&mut photo, &mut video]).await?;
                Ok(UnitOutcome::Completed)
            }
            Err(e) => {
                self.fail_pair(photo, video, Some(Failure::upload(&e)), None)
                    .await
            }
        }
    }

    /// Download, verify and inject one asset, persisting each transition.
    async fn fetch(&self, record: &mut MigrationRecord) -> Result<Step<Fetched>, StateError> {
        if self.cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }

        let dir = self.asset_dir(&record.source_id);
        let path = dir.join(scratch_file_name(record));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return Ok(Step::Failed(Failure::local(
                ErrorKind::LocalIo,
                format!("Failed to create {}: {e}", dir.display()),
            )));
        }

        record.status = RecordStatus::Downloading;
        record.local_temp_path = Some(path.clone());
        self.save(record).await?;

        let source = &self.source;
        let source_id = record.source_id.clone();
        let downloaded = match retry_with_backoff(
            &self.settings.retry,
            "download",
            classify,
            || source.download(&source_id, &path),
        )
        .await
        {
            Ok(d) => d,
            Err(e) => return Ok(Step::Failed(Failure::download(&e))),
        };
        tracing::debug!(
            source_id = %record.source_id,
            bytes = downloaded.bytes_written,
            "Downloaded"
        );
        if downloaded.declared_checksum.is_some() {
            record.declared_checksum = downloaded.declared_checksum.clone();
        }
        record.status = RecordStatus::Downloaded;
        self.save(record).await?;
        if self.cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }

        let expected = record
            .declared_checksum
            .as_deref()
            .and_then(DeclaredDigest::parse)
            .or_else(|| {
                record
                    .content_hash
                    .as_deref()
                    .and_then(ContentHash::parse)
                    .map(DeclaredDigest::from)
            });
        match expected {
            Some(expected) => match checksum::verify_async(expected, &path).await {
                Ok(hash) => record.content_hash = Some(hash.to_hex()),
                Err(e @ ChecksumError::Mismatch { .. }) => {
                    tracing::warn!(source_id = %record.source_id, "{}", e);
                    return Ok(Step::Failed(Failure {
                        kind: ErrorKind::ChecksumMismatch,
                        message: e.to_string(),
                        transient: true,
                        side: Side::Source,
                    }));
                }
                Err(e) => {
                    return Ok(Step::Failed(Failure::local(
                        ErrorKind::LocalIo,
                        e.to_string(),
                    )))
                }
            },
            None => match checksum::hash_file_async(&path).await {
                Ok(hash) => record.content_hash = Some(hash.to_hex()),
                Err(e) => {
                    return Ok(Step::Failed(Failure::local(
                        ErrorKind::LocalIo,
                        e.to_string(),
                    )))
                }
            },
        }
        record.status = RecordStatus::Verified;
        self.save(record).await?;
        if self.cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }

        if record.kind != AssetKind::Sidecar {
            if let Err(e) = metadata::inject_async(&path, &downloaded.capture_metadata).await {
                if self.settings.strict_metadata {
                    return Ok(Step::Failed(Failure::local(
                        ErrorKind::MetadataInjection,
                        e.to_string(),
                    )));
                }
                tracing::warn!(
                    source_id = %record.source_id,
                    "Metadata not fully preserved: {}",
                    e
                );
                record.metadata_warning = Some(e.to_string());
            }
        }
        record.status = RecordStatus::MetadataInjected;
        self.save(record).await?;

        Ok(Step::Done(Fetched {
            path,
            capture_metadata: downloaded.capture_metadata,
        }))
    }

    async fn upload(&self, path: &Path, request: &UploadRequest) -> Result<String, TransferError> {
        let destination = &self.destination;
        retry_with_backoff(&self.settings.retry, "upload", classify, || {
            destination.upload(path, request)
        })
        .await
    }

    async fn fail_single(
        &self,
        mut record: MigrationRecord,
        failure: Failure,
    ) -> Result<UnitOutcome, StateError> {
        let permanent = self.apply_failure(&mut record, &failure, failure.transient);
        self.cleanup(&mut record).await;
        self.save(&mut record).await?;
        Ok(UnitOutcome::Failed {
            permanent,
            destination_transient: failure.transient && failure.side == Side::Destination,
        })
    }

    /// Fail both members with one shared disposition. A member without its
    /// own failure is marked `paired_asset_failed`.
    async fn fail_pair(
        &self,
        mut photo: MigrationRecord,
        mut video: MigrationRecord,
        photo_failure: Option<Failure>,
        video_failure: Option<Failure>,
    ) -> Result<UnitOutcome, StateError> {
        let failures: Vec<&Failure> = photo_failure.iter().chain(video_failure.iter()).collect();
        let transient = failures.iter().all(|f| f.transient);
        let destination_transient =
            transient && failures.iter().any(|f| f.side == Side::Destination);

        let partner_failure = |own: &Option<Failure>, partner_id: &str| {
            own.clone().unwrap_or_else(|| Failure {
                kind: ErrorKind::PairedAssetFailed,
                message: format!("Live photo partner {partner_id} failed"),
                transient,
                side: Side::Local,
            })
        };
        let photo_failure = partner_failure(&photo_failure, &video.source_id);
        let video_failure = partner_failure(&video_failure, &photo.source_id);

        let photo_permanent = self.apply_failure(&mut photo, &photo_failure, transient);
        let video_permanent = self.apply_failure(&mut video, &video_failure, transient);
        let permanent = photo_permanent || video_permanent;
        if permanent {
            photo.status = RecordStatus::FailedPermanent;
            video.status = RecordStatus::FailedPermanent;
        }

        self.cleanup(&mut photo).await;
        self.cleanup(&mut video).await;
        self.save_many(&mut [&mut photo, &mut video]).await?;
        Ok(UnitOutcome::Failed {
            permanent,
            destination_transient,
        })
    }

    /// Set the failed status, consuming an attempt for transient failures.
    /// Returns whether the record is now permanently failed.
    fn apply_failure(&self, record: &mut MigrationRecord, failure: &Failure, transient: bool) -> bool {
        if transient {
            record.attempt_count += 1;
        }
        let permanent = !transient || record.attempt_count >= self.settings.max_attempts;
        record.status = if permanent {
            RecordStatus::FailedPermanent
        } else {
            RecordStatus::FailedTransient
        };
        record.last_error_kind = Some(failure.kind);
        record.last_error = Some(failure.message.clone());

        if permanent {
            tracing::error!(
                source_id = %record.source_id,
                kind = %failure.kind,
                attempts = record.attempt_count,
                "Asset failed permanently: {}",
                failure.message
            );
        } else {
            tracing::warn!(
                source_id = %record.source_id,
                kind = %failure.kind,
                attempts = record.attempt_count,
                "Asset failed, will retry: {}",
                failure.message
            );
        }
        permanent
    }

    fn asset_dir(&self, source_id: &str) -> PathBuf {
        self.settings
            .scratch_dir
            .join(sanitize(&self.run_id))
            .join(sanitize(source_id))
    }

    /// Remove the asset's scratch directory. A retry downloads again.
    async fn cleanup(&self, record: &mut MigrationRecord) {
        let dir = self.asset_dir(&record.source_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    source_id = %record.source_id,
                    "Failed to remove scratch directory {}: {}",
                    dir.display(),
                    e
                );
            }
        }
        record.local_temp_path = None;
    }

    async fn save(&self, record: &mut MigrationRecord) -> Result<(), StateError> {
        record.updated_at = chrono::Utc::now();
        self.store.upsert(record).await?;
        self.events.emit(ProgressEvent::AssetStatus {
            source_id: record.source_id.clone(),
            status: record.status,
        });
        Ok(())
    }

    async fn save_many(&self, records: &mut [&mut MigrationRecord]) -> Result<(), StateError> {
        let now = chrono::Utc::now();
        for record in records.iter_mut() {
            record.updated_at = now;
        }
        let owned: Vec<MigrationRecord> = records.iter().map(|r| (**r).clone()).collect();
        self.store.upsert_many(&owned).await?;
        for record in &owned {
            self.events.emit(ProgressEvent::AssetStatus {
                source_id: record.source_id.clone(),
                status: record.status,
            });
        }
        Ok(())
    }
}

fn classify(e: &TransferError) -> RetryAction {
    if e.is_transient() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

/// Make an id or filename safe to use as a single path component.
fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}

fn scratch_file_name(record: &MigrationRecord) -> String {
    let base = Path::new(&record.original_filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if base.is_empty() {
        sanitize(&record.source_id)
    } else {
        sanitize(base)
    }
}
