//! Signal handling for graceful server shutdown.

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Returns once SIGINT or SIGTERM is received.
pub async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("📡 Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("📡 Received SIGTERM");
        }
    }

    Ok(())
}
