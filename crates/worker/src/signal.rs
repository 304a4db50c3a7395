//! Signal handling for graceful shutdown.

use tracing::info;

/// Wait for SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!(signal = "SIGINT", "signal received");
        }
        _ = sigterm.recv() => {
            info!(signal = "SIGTERM", "signal received");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "signal received");
    Ok(())
}
