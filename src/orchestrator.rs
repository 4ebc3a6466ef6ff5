//! Migration orchestrator: opens or creates a run, reconciles the source
//! listing against the state store, drives batches until nothing is
//! queueable, and reports.
//!
//! Phases: `Initializing → Reconciling → Executing → Reporting → Done`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{plan_batches, BatchScheduler};
use crate::progress::{EventSink, ProgressEvent};
use crate::retry::{retry_with_backoff, RetryAction, RetryPolicy};
use crate::state::{
    ErrorKind, MigrationRecord, MigrationRun, MigrationSettings, RecordStatus, RunOutcome,
    SqliteStateStore, StateError, StateStore, StatusCounts,
};
use crate::transfer::{self, AlbumRef, MediaServer, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Initializing,
    Reconciling,
    Executing,
    Reporting,
    Done,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::Reconciling => "reconciling",
            Self::Executing => "executing",
            Self::Reporting => "reporting",
            Self::Done => "done",
        })
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("Failed to list {what} on the source server: {source}")]
    SourceListing {
        what: String,
        source: TransferError,
    },

    #[error("Failed to prepare destination album '{album}': {source}")]
    DestinationAlbum {
        album: String,
        source: TransferError,
    },

    #[error("Album '{0}' not found on the source server")]
    AlbumNotFound(String),

    #[error("No albums selected")]
    NoAlbums,
}

impl MigrationError {
    /// Remote-side problems end the run early but leave it resumable.
    fn aborts_run(&self) -> bool {
        matches!(
            self,
            Self::SourceListing { .. } | Self::DestinationAlbum { .. } | Self::AlbumNotFound(_)
        )
    }
}

/// Which source albums a new run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlbumSelection {
    /// Album ids or names.
    Named(Vec<String>),
    All,
}

#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub state_dir: PathBuf,
    /// Resume this run if it exists, else create it under this id.
    pub run_id: Option<String>,
    pub albums: AlbumSelection,
    /// Used only when the run is created.
    pub settings: MigrationSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentFailure {
    pub source_id: String,
    pub kind: Option<ErrorKind>,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub counts: StatusCounts,
    /// Assets completed by this invocation.
    pub transferred: usize,
    pub batches: usize,
    pub permanent_failures: Vec<PermanentFailure>,
    pub abort_reason: Option<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Done && self.permanent_failures.is_empty()
    }
}

/// Reconciled album ready for execution.
#[derive(Debug, Clone)]
struct AlbumContext {
    source_album_id: String,
    name: String,
    destination_album_id: String,
}

/// Per-album reconciliation tally.
#[derive(Debug, Default)]
struct Reconciled {
    queued: usize,
    already_completed: usize,
    failed_permanent: usize,
}

/// The only entry point the CLI uses to run a migration.
pub struct Migrator {
    source: Arc<dyn MediaServer>,
    destination: Arc<dyn MediaServer>,
    events: EventSink,
    cancel: CancellationToken,
}

impl Migrator {
    pub fn new(
        source: Arc<dyn MediaServer>,
        destination: Arc<dyn MediaServer>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            destination,
            events,
            cancel,
        }
    }

    /// Open the run and drive it to an outcome.
    pub async fn migrate(&self, request: MigrationRequest) -> Result<RunSummary, MigrationError> {
        let (store, run) = self.open_run(&request).await?;
        self.run(Arc::new(store), run).await
    }

    /// Initializing: resume `request.run_id` if its store exists, otherwise
    /// create a new run with the requested albums and settings.
    pub async fn open_run(
        &self,
        request: &MigrationRequest,
    ) -> Result<(SqliteStateStore, MigrationRun), MigrationError> {
        self.phase(RunPhase::Initializing);

        if let Some(run_id) = &request.run_id {
            match SqliteStateStore::load(&request.state_dir, run_id).await {
                Ok((store, run)) => {
                    tracing::info!(run_id = %run.run_id, "Resuming migration run");
                    if run.settings != request.settings {
                        tracing::info!(
                            run_id = %run.run_id,
                            "Using the settings stored with the run; command-line values are ignored"
                        );
                    }
                    return Ok((store, run));
                }
                Err(StateError::RunNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let album_ids = self
            .resolve_albums(&request.albums, &request.settings.retry)
            .await?;
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (store, run) = SqliteStateStore::create(
            &request.state_dir,
            &run_id,
            album_ids,
            request.settings.clone(),
        )
        .await?;
        tracing::info!(
            run_id = %run.run_id,
            albums = run.album_ids.len(),
            "Created migration run"
        );
        Ok((store, run))
    }

    async fn resolve_albums(
        &self,
        selection: &AlbumSelection,
        policy: &RetryPolicy,
    ) -> Result<Vec<String>, MigrationError> {
        let albums = self.list_source_albums(policy).await?;
        let ids: Vec<String> = match selection {
            AlbumSelection::All => albums.into_iter().map(|a| a.id).collect(),
            AlbumSelection::Named(wanted) => {
                let mut ids = Vec::new();
                for name in wanted {
                    let album = albums
                        .iter()
                        .find(|a| &a.id == name || &a.name == name)
                        .ok_or_else(|| MigrationError::AlbumNotFound(name.clone()))?;
                    if !ids.contains(&album.id) {
                        ids.push(album.id.clone());
                    }
                }
                ids
            }
        };
        if ids.is_empty() {
            return Err(MigrationError::NoAlbums);
        }
        Ok(ids)
    }

    /// Reconcile, execute and report an opened run.
    pub async fn run(
        &self,
        store: Arc<dyn StateStore>,
        run: MigrationRun,
    ) -> Result<RunSummary, MigrationError> {
        let started = Instant::now();
        let settings = run.settings.clone();
        let mut abort_reason: Option<String> = None;
        let mut transferred = 0;
        let mut batches = 0;

        self.phase(RunPhase::Reconciling);
        let mut albums = Vec::new();
        match self.list_source_albums(&settings.retry).await {
            Ok(listed) => {
                for album_id in &run.album_ids {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let result = match listed.iter().find(|a| &a.id == album_id) {
                        Some(album) => self.reconcile_album(store.as_ref(), &settings, album).await,
                        None => Err(MigrationError::AlbumNotFound(album_id.clone())),
                    };
                    match result {
                        Ok(ctx) => albums.push(ctx),
                        Err(e) if e.aborts_run() => {
                            tracing::error!(run_id = %run.run_id, "{}", e);
                            abort_reason = Some(e.to_string());
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) if e.aborts_run() => {
                tracing::error!(run_id = %run.run_id, "{}", e);
                abort_reason = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        if abort_reason.is_none() {
            self.phase(RunPhase::Executing);
            let scheduler = BatchScheduler::new(
                self.source.clone(),
                self.destination.clone(),
                store.clone(),
                settings.clone(),
                run.run_id.clone(),
                self.events.clone(),
                self.cancel.clone(),
            );

            'passes: loop {
                let mut ran_any = false;
                for album in &albums {
                    self.link_members(store.as_ref(), &settings.retry, album).await?;
                    let queue = queueable(
                        store.list_album(&album.source_album_id).await?,
                        settings.max_attempts,
                    );
                    for batch in plan_batches(queue, settings.batch_size) {
                        if self.cancel.is_cancelled() {
                            break 'passes;
                        }
                        batches += 1;
                        ran_any = true;
                        let assets: usize = batch.iter().map(|u| u.asset_count()).sum();
                        self.events.emit(ProgressEvent::BatchStarted {
                            album: album.name.clone(),
                            batch: batches,
                            assets,
                        });
                        tracing::debug!(album = %album.name, batch = batches, assets, "Starting batch");

                        let report = scheduler.run(batch).await?;
                        transferred += report.completed;
                        self.link_members(store.as_ref(), &settings.retry, album).await?;
                        let unreachable = report.destination_unreachable;
                        self.events.emit(ProgressEvent::BatchFinished {
                            album: album.name.clone(),
                            batch: batches,
                            report,
                        });
                        if unreachable {
                            let reason =
                                "Destination unreachable: every transfer in the batch failed".to_string();
                            tracing::error!(run_id = %run.run_id, album = %album.name, "{}", reason);
                            abort_reason = Some(reason);
                            break 'passes;
                        }
                    }
                }
                if !ran_any || self.cancel.is_cancelled() {
                    break;
                }
            }
        }

        self.phase(RunPhase::Reporting);
        let counts = store.counts().await?;
        let permanent_failures = store
            .list(Some(RecordStatus::FailedPermanent))
            .await?
            .into_iter()
            .map(|r| PermanentFailure {
                source_id: r.source_id,
                kind: r.last_error_kind,
                message: r.last_error,
            })
            .collect();
        let outcome = if abort_reason.is_some() {
            RunOutcome::Aborted
        } else if self.cancel.is_cancelled() {
            RunOutcome::Interrupted
        } else if counts.unfinished() == 0 {
            RunOutcome::Done
        } else {
            RunOutcome::Aborted
        };
        store.finish_run(outcome).await?;

        let summary = RunSummary {
            run_id: run.run_id,
            outcome,
            counts,
            transferred,
            batches,
            permanent_failures,
            abort_reason,
            elapsed: started.elapsed(),
        };
        self.events.emit(ProgressEvent::Finished(summary.clone()));
        self.phase(RunPhase::Done);
        Ok(summary)
    }

    /// Ensure the destination album, record membership, and bring every
    /// listed asset's record to a schedulable state.
    async fn reconcile_album(
        &self,
        store: &dyn StateStore,
        settings: &MigrationSettings,
        album: &AlbumRef,
    ) -> Result<AlbumContext, MigrationError> {
        let destination_album_id = match store.album_destination(&album.id).await? {
            Some(id) => id,
            None => {
                let id = self.ensure_destination_album(&settings.retry, &album.name).await?;
                store.set_album_destination(&album.id, &album.name, &id).await?;
                id
            }
        };

        let source = &self.source;
        let mut assets = retry_with_backoff(&settings.retry, "list_assets", classify, || {
            source.list_assets(&album.id)
        })
        .await
        .map_err(|source| MigrationError::SourceListing {
            what: format!("assets of album '{}'", album.name),
            source,
        })?;
        transfer::types::normalize_pairs(&mut assets);

        let member_ids: Vec<String> = assets.iter().map(|a| a.source_id.clone()).collect();
        store.add_members(&album.id, &member_ids).await?;

        let mut tally = Reconciled::default();
        let mut updates = Vec::new();
        for asset in &assets {
            let Some(mut record) = store.get(&asset.source_id).await? else {
                tally.queued += 1;
                updates.push(MigrationRecord::new_pending(asset, &album.id));
                continue;
            };
            if record.status == RecordStatus::Completed {
                tally.already_completed += 1;
                continue;
            }

            let mut changed = false;
            if asset.declared_checksum.is_some() && record.declared_checksum != asset.declared_checksum
            {
                tracing::info!(
                    source_id = %record.source_id,
                    "Source checksum changed since the last run"
                );
                record.declared_checksum = asset.declared_checksum.clone();
                record.content_hash = None;
                changed = true;
            }
            if record.pair_id != asset.pair_id {
                record.pair_id = asset.pair_id.clone();
                changed = true;
            }
            if record.status.is_in_flight() {
                tracing::debug!(
                    source_id = %record.source_id,
                    status = %record.status,
                    "Resetting interrupted asset"
                );
                remove_stale_temp(&record).await;
                record.status = RecordStatus::Pending;
                record.local_temp_path = None;
                changed = true;
            }
            if record.status == RecordStatus::FailedTransient
                && record.attempt_count >= settings.max_attempts
            {
                record.status = RecordStatus::FailedPermanent;
                changed = true;
            }

            match record.status {
                RecordStatus::FailedPermanent => tally.failed_permanent += 1,
                _ => tally.queued += 1,
            }
            if changed {
                record.updated_at = chrono::Utc::now();
                updates.push(record);
            }
        }
        store.upsert_many(&updates).await?;

        tracing::info!(
            album = %album.name,
            queued = tally.queued,
            already_completed = tally.already_completed,
            failed_permanent = tally.failed_permanent,
            "Reconciled album"
        );
        self.events.emit(ProgressEvent::Reconciled {
            album: album.name.clone(),
            queued: tally.queued,
            already_completed: tally.already_completed,
            failed_permanent: tally.failed_permanent,
        });

        Ok(AlbumContext {
            source_album_id: album.id.clone(),
            name: album.name.clone(),
            destination_album_id,
        })
    }

    /// Reuse a same-name destination album or create one.
    async fn ensure_destination_album(
        &self,
        policy: &RetryPolicy,
        name: &str,
    ) -> Result<String, MigrationError> {
        let destination = &self.destination;
        let wrap = |source| MigrationError::DestinationAlbum {
            album: name.to_string(),
            source,
        };
        let existing = retry_with_backoff(policy, "list_albums", classify, || {
            destination.list_albums()
        })
        .await
        .map_err(wrap)?;
        if let Some(album) = existing.into_iter().find(|a| a.name == name) {
            tracing::info!(album = %name, destination_album_id = %album.id, "Reusing destination album");
            return Ok(album.id);
        }
        let id = retry_with_backoff(policy, "create_album", classify, || {
            destination.create_album(name)
        })
        .await
        .map_err(wrap)?;
        tracing::info!(album = %name, destination_album_id = %id, "Created destination album");
        Ok(id)
    }

    /// Push completed members of `album` to its destination album. Failures
    /// are left for the next batch or run.
    async fn link_members(
        &self,
        store: &dyn StateStore,
        policy: &RetryPolicy,
        album: &AlbumContext,
    ) -> Result<(), StateError> {
        let unlinked = store.unlinked_members(&album.source_album_id).await?;
        if unlinked.is_empty() {
            return Ok(());
        }
        let (source_ids, destination_ids): (Vec<String>, Vec<String>) =
            unlinked.into_iter().unzip();
        let destination = &self.destination;
        let result = retry_with_backoff(policy, "add_to_album", classify, || {
            destination.add_to_album(&album.destination_album_id, &destination_ids)
        })
        .await;
        match result {
            Ok(()) => {
                store
                    .mark_linked(&album.source_album_id, &source_ids)
                    .await?;
                tracing::debug!(album = %album.name, count = source_ids.len(), "Linked album members");
            }
            Err(e) => {
                tracing::warn!(album = %album.name, "Failed to add assets to destination album: {}", e);
            }
        }
        Ok(())
    }

    async fn list_source_albums(&self, policy: &RetryPolicy) -> Result<Vec<AlbumRef>, MigrationError> {
        let source = &self.source;
        retry_with_backoff(policy, "list_albums", classify, || {
            source.list_albums()
        })
        .await
        .map_err(|source| MigrationError::SourceListing {
            what: "albums".into(),
            source,
        })
    }

    fn phase(&self, phase: RunPhase) {
        tracing::debug!(phase = %phase, "Run phase");
        self.events.emit(ProgressEvent::PhaseChanged(phase));
    }
}

/// Records the next pass should attempt.
fn queueable(records: Vec<MigrationRecord>, max_attempts: u32) -> Vec<MigrationRecord> {
    records
        .into_iter()
        .filter(|r| match r.status {
            RecordStatus::Pending => true,
            RecordStatus::FailedTransient => r.attempt_count < max_attempts,
            _ => false,
        })
        .collect()
}

async fn remove_stale_temp(record: &MigrationRecord) {
    let Some(path) = &record.local_temp_path else {
        return;
    };
    for stale in [path.clone(), transfer::part_path(path)] {
        if let Err(e) = tokio::fs::remove_file(&stale).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    source_id = %record.source_id,
                    "Failed to remove stale temp file {}: {}",
                    stale.display(),
                    e
                );
            }
        }
    }
}

fn classify(e: &TransferError) -> RetryAction {
    if e.is_transient() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}
