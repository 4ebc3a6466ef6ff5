//! media-migrate: resumable album migration between media servers.
//!
//! Albums are copied asset by asset from a source server to a destination
//! server. Each asset is downloaded, checked against its content hash, has
//! its capture metadata re-injected, and is uploaded. Progress is kept in a
//! per-run SQLite database, so an interrupted run resumes where it stopped
//! without uploading anything twice.

#![warn(clippy::all)]

mod checksum;
mod cli;
mod config;
mod metadata;
mod orchestrator;
mod pipeline;
mod progress;
mod retry;
mod shutdown;
mod state;
mod transfer;
mod types;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::ServerConfig;
use orchestrator::{Migrator, MigrationRequest, RunSummary};
use state::{RecordStatus, ResetScope, RunOutcome, SqliteStateStore, StateStore};
use transfer::{HttpMediaServer, MediaServer};

fn connect(server: &ServerConfig) -> anyhow::Result<Arc<dyn MediaServer>> {
    let client = HttpMediaServer::new(&server.url, &server.api_key, server.timeout)
        .with_context(|| format!("Failed to set up client for {}", server.url))?;
    Ok(Arc::new(client))
}

/// Run the migrate command.
async fn run_migrate(args: cli::MigrateArgs) -> anyhow::Result<()> {
    let config = config::Config::from_cli(args)?;
    tracing::debug!(?config, "Resolved configuration");

    let source = connect(&config.source)?;
    let destination = connect(&config.destination)?;
    let shutdown_token = shutdown::install_signal_handler();
    let (events, receiver) = progress::EventSink::channel();
    let reporter = progress::spawn_reporter(config.no_progress_bar, receiver);

    let migrator = Migrator::new(source, destination, events, shutdown_token);
    let result = migrator
        .migrate(MigrationRequest {
            state_dir: config.state_dir.clone(),
            run_id: config.run_id.clone(),
            albums: config.albums.clone(),
            settings: config.settings.clone(),
        })
        .await;
    // Closing the event channel lets the reporter finish.
    drop(migrator);
    if let Err(e) = reporter.await {
        tracing::debug!("Progress reporter ended abnormally: {}", e);
    }

    let summary = result.context("Migration failed")?;
    log_summary(&summary);
    if summary.is_success() {
        tracing::info!(run_id = %summary.run_id, "Migration complete");
        return Ok(());
    }

    match summary.outcome {
        RunOutcome::Aborted => {
            anyhow::bail!(
                "Run {} aborted: {}",
                summary.run_id,
                summary.abort_reason.as_deref().unwrap_or("unfinished assets remain")
            );
        }
        RunOutcome::Interrupted => {
            tracing::info!(
                "Resume with: media-migrate migrate --run-id {}",
                summary.run_id
            );
        }
        RunOutcome::Done => {}
    }
    if !summary.permanent_failures.is_empty() {
        anyhow::bail!(
            "{} assets failed permanently; inspect with `media-migrate status --run-id {} --failed`",
            summary.permanent_failures.len(),
            summary.run_id
        );
    }
    Ok(())
}

fn log_summary(summary: &RunSummary) {
    let counts = &summary.counts;
    tracing::info!("── Summary ──");
    tracing::info!("  run: {} ({})", summary.run_id, summary.outcome);
    tracing::info!(
        "  {} transferred this run in {} batches",
        summary.transferred,
        summary.batches
    );
    tracing::info!(
        "  {} completed, {} failed, {} still pending, {} total",
        counts.completed,
        counts.failed_permanent,
        counts.unfinished(),
        counts.total()
    );
    for failure in &summary.permanent_failures {
        tracing::warn!(
            "  failed: {} ({}): {}",
            failure.source_id,
            failure.kind.map(|k| k.as_str()).unwrap_or("unknown"),
            failure.message.as_deref().unwrap_or("no details")
        );
    }
    tracing::info!("  elapsed: {}", progress::format_duration(summary.elapsed));
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let state_dir = config::state_dir(&args.state);
    let (store, run) = SqliteStateStore::load(&state_dir, &args.run_id).await?;
    let counts = store.counts().await?;

    println!("Run:        {}", run.run_id);
    println!("Database:   {}", store.path().display());
    println!("Albums:     {}", run.album_ids.join(", "));
    println!(
        "Created:    {}",
        run.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    match (&run.finished_at, &run.outcome) {
        (Some(finished), Some(outcome)) => println!(
            "Last run:   {} at {}",
            outcome,
            finished.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        _ => println!("Last run:   never finished"),
    }
    println!();
    println!("Assets:");
    println!("  Total:            {}", counts.total());
    println!("  Completed:        {}", counts.completed);
    println!("  Pending:          {}", counts.pending);
    println!("  In flight:        {}", counts.in_flight);
    println!("  Failed (retry):   {}", counts.failed_transient);
    println!("  Failed (final):   {}", counts.failed_permanent);

    if args.records {
        println!();
        println!("Records:");
        for record in store.list(None).await? {
            println!(
                "  {} {} attempts={} destination={}",
                record.source_id,
                record.status,
                record.attempt_count,
                record.destination_id.as_deref().unwrap_or("-")
            );
        }
    }

    if args.failed && counts.failed_permanent > 0 {
        println!();
        println!("Failed assets:");
        for record in store.list(Some(RecordStatus::FailedPermanent)).await? {
            println!(
                "  {} ({}) [{}] - {}",
                record.original_filename,
                record.source_id,
                record
                    .last_error_kind
                    .map(|k| k.as_str())
                    .unwrap_or("unknown"),
                record.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

/// Run the reset command.
async fn run_reset(args: cli::ResetArgs) -> anyhow::Result<()> {
    let state_dir = config::state_dir(&args.state);
    let (store, _) = SqliteStateStore::load(&state_dir, &args.run_id).await?;
    let scope = match args.source_id {
        Some(id) => ResetScope::One(id),
        None => ResetScope::AllFailed,
    };
    let count = store.reset_permanent(&scope).await?;
    if count == 0 {
        println!("No permanently failed assets matched.");
    } else {
        println!(
            "Reset {} assets to pending. Resume with: media-migrate migrate --run-id {}",
            count, args.run_id
        );
    }
    Ok(())
}

/// Run the list-albums command.
async fn run_list_albums(args: cli::ListAlbumsArgs) -> anyhow::Result<()> {
    let source = connect(&ServerConfig::source(&args.source))?;
    let albums = source.list_albums().await.context("Failed to list albums")?;
    println!("Albums:");
    for album in albums {
        match album.asset_count {
            Some(n) => println!("  {} ({}, {} assets)", album.name, album.id, n),
            None => println!("  {} ({})", album.name, album.id),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Migrate(args) => run_migrate(args).await,
        Command::Status(args) => run_status(args).await,
        Command::Reset(args) => run_reset(args).await,
        Command::ListAlbums(args) => run_list_albums(args).await,
    }
}
