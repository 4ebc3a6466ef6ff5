//! Progress events emitted by the engine and the terminal reporter that
//! renders them.
//!
//! The engine never touches the terminal. It sends [`ProgressEvent`]s on an
//! unbounded channel; the CLI owns the receiving end and drives an
//! `indicatif` bar from it.

use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::orchestrator::{RunPhase, RunSummary};
use crate::pipeline::BatchReport;
use crate::state::RecordStatus;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    PhaseChanged(RunPhase),
    Reconciled {
        album: String,
        queued: usize,
        already_completed: usize,
        failed_permanent: usize,
    },
    BatchStarted {
        album: String,
        batch: usize,
        assets: usize,
    },
    BatchFinished {
        album: String,
        batch: usize,
        report: BatchReport,
    },
    AssetStatus {
        source_id: String,
        status: RecordStatus,
    },
    Finished(RunSummary),
}

/// Sending half handed to the engine. A default sink discards events.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<ProgressEvent>>);

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.0 {
            // Receiver gone means nobody is rendering; not an engine error.
            let _ = tx.send(event);
        }
    }
}

/// Create a progress bar with a consistent template.
///
/// Returns `ProgressBar::hidden()` when the user passed `--no-progress-bar` or
/// stdout is not a TTY.
pub fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> "),
    );
    pb
}

/// Whether a status ends one processing attempt of an asset.
fn ends_attempt(status: RecordStatus) -> bool {
    status.is_terminal() || status == RecordStatus::FailedTransient
}

/// Render events until the sending side is dropped.
///
/// Log lines go through `ProgressBar::suspend` so they do not tear the bar.
pub fn spawn_reporter(
    no_progress_bar: bool,
    mut events: mpsc::UnboundedReceiver<ProgressEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pb = create_progress_bar(no_progress_bar, 0);
        while let Some(event) = events.recv().await {
            match event {
                ProgressEvent::PhaseChanged(phase) => {
                    pb.suspend(|| tracing::debug!(phase = %phase, "Run phase changed"));
                }
                ProgressEvent::Reconciled {
                    album,
                    queued,
                    already_completed,
                    failed_permanent,
                } => {
                    pb.suspend(|| {
                        tracing::info!(
                            album = %album,
                            "{} queued, {} already migrated, {} permanently failed",
                            queued,
                            already_completed,
                            failed_permanent
                        )
                    });
                }
                ProgressEvent::BatchStarted {
                    album,
                    batch,
                    assets,
                } => {
                    pb.inc_length(assets as u64);
                    pb.set_message(format!("{album} (batch {batch})"));
                }
                ProgressEvent::BatchFinished {
                    album,
                    batch,
                    report,
                } => {
                    pb.suspend(|| {
                        tracing::debug!(
                            album = %album,
                            batch,
                            completed = report.completed,
                            failed_transient = report.failed_transient,
                            failed_permanent = report.failed_permanent,
                            cancelled = report.cancelled,
                            "Batch finished"
                        )
                    });
                }
                ProgressEvent::AssetStatus { source_id, status } => {
                    if ends_attempt(status) {
                        pb.inc(1);
                    }
                    if status == RecordStatus::FailedPermanent {
                        pb.suspend(|| {
                            tracing::warn!(source_id = %source_id, "Asset failed permanently")
                        });
                    }
                }
                ProgressEvent::Finished(summary) => {
                    pb.finish_and_clear();
                    tracing::debug!(
                        run_id = %summary.run_id,
                        outcome = %summary.outcome,
                        "Run finished"
                    );
                }
            }
        }
        pb.finish_and_clear();
    })
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(754)), "12m 34s");
        assert_eq!(format_duration(Duration::from_secs(5025)), "1h 23m 45s");
    }

    #[test]
    fn test_create_progress_bar_hidden_when_disabled() {
        assert!(create_progress_bar(true, 100).is_hidden());
    }

    #[test]
    fn test_default_sink_discards() {
        EventSink::default().emit(ProgressEvent::PhaseChanged(RunPhase::Reconciling));
    }

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(ProgressEvent::PhaseChanged(RunPhase::Reconciling));
        sink.emit(ProgressEvent::AssetStatus {
            source_id: "a".into(),
            status: RecordStatus::Completed,
        });
        drop(sink);
        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::PhaseChanged(RunPhase::Reconciling))
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::AssetStatus {
                status: RecordStatus::Completed,
                ..
            })
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reporter_exits_when_sender_dropped() {
        let (sink, rx) = EventSink::channel();
        let handle = spawn_reporter(true, rx);
        sink.emit(ProgressEvent::BatchStarted {
            album: "Holiday".into(),
            batch: 1,
            assets: 2,
        });
        drop(sink);
        handle.await.unwrap();
    }
}
