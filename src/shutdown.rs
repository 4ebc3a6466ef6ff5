//! Signal handling for migrations.
//!
//! The first SIGINT, SIGTERM or SIGHUP cancels the run token. Workers stop
//! between pipeline steps and the run is recorded as interrupted, so the
//! next `migrate` with the same run id resumes it. A second signal exits
//! immediately with status 130.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Exit status used when the operator insists on stopping.
pub(crate) const FORCE_EXIT_CODE: i32 = 130;

/// Wait for the next shutdown signal. Unix signals that cannot be
/// registered are logged and ignored; Ctrl+C is always watched.
#[cfg(unix)]
async fn next_signal(
    sigterm: &mut Option<tokio::signal::unix::Signal>,
    sighup: &mut Option<tokio::signal::unix::Signal>,
) {
    async fn recv(signal: &mut Option<tokio::signal::unix::Signal>) {
        match signal {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = recv(sigterm) => {}
        _ = recv(sighup) => {}
    }
}

/// Spawn the signal listener and return the token it cancels.
pub(crate) fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let received = Arc::new(AtomicU32::new(0));

    let handler_token = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let (mut sigterm, mut sighup) = {
            use tokio::signal::unix::{signal, SignalKind};
            let register = |kind: SignalKind, name: &str| match signal(kind) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!("Cannot listen for {}: {}", name, e);
                    None
                }
            };
            (
                register(SignalKind::terminate(), "SIGTERM"),
                register(SignalKind::hangup(), "SIGHUP"),
            )
        };

        loop {
            #[cfg(unix)]
            next_signal(&mut sigterm, &mut sighup).await;

            #[cfg(not(unix))]
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Cannot listen for Ctrl+C: {}", e);
                return;
            }

            if received.fetch_add(1, Ordering::SeqCst) == 0 {
                tracing::info!(
                    "Shutdown requested; finishing in-flight steps. The run can be resumed later"
                );
                tracing::info!("Press Ctrl+C again to stop immediately");
                handler_token.cancel();
            } else {
                tracing::warn!("Stopping immediately");
                std::process::exit(FORCE_EXIT_CODE);
            }
        }
    });

    token
}
