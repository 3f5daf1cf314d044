//! Signal handling for graceful shutdown.

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::info;

/// Signal that asked the daemon to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
    Hangup,
}

/// Set up signal handlers for graceful shutdown.
///
/// Returns a receiver that yields the first SIGTERM, SIGINT or SIGHUP.
/// Links are owned by this process, so every one of them ends in the same
/// orderly teardown.
pub fn setup_signal_handlers() -> Result<mpsc::Receiver<ShutdownSignal>> {
    let (tx, rx) = mpsc::channel(1);

    for (kind, which) in [
        (SignalKind::terminate(), ShutdownSignal::Terminate),
        (SignalKind::interrupt(), ShutdownSignal::Interrupt),
        (SignalKind::hangup(), ShutdownSignal::Hangup),
    ] {
        let mut stream = signal(kind).with_context(|| format!("Failed to install {which:?} handler"))?;
        let tx = tx.clone();

        tokio::spawn(async move {
            if stream.recv().await.is_some() {
                info!(signal = ?which, "Received shutdown signal");
                let _ = tx.send(which).await;
            }
        });
    }

    Ok(rx)
}
