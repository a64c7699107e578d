//! Process signals: reload requests and orderly shutdown.

use geod_host::Registry;
use geod_server::ShutdownSignal;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

/// Raises the module rescan flag on every SIGUSR1 until shutdown.
pub async fn forward_reload_requests(registry: Arc<Registry>, shutdown: ShutdownSignal) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        loop {
            tokio::select! {
                received = sigusr1.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("📡 Received SIGUSR1, scheduling module rescan");
                    registry.request_reload();
                }
                _ = shutdown.wait() => break,
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = registry;
        shutdown.wait().await;
    }

    Ok(())
}

/// Waits for a termination request from the operating system.
///
/// Listens for termination signals and returns when the first one arrives,
/// so the caller can stop accepting connections, drain live ones and unload
/// every module before the process exits.
///
/// # Platform Support
///
/// * **Unix platforms**: Handles SIGINT and SIGTERM signals
/// * **Windows**: Handles Ctrl+C signal
///
/// SIGUSR1 is not a termination signal; see [`forward_reload_requests`].
///
/// # Returns
///
/// `Ok(())` when a termination signal is received, or an error if the
/// signal handlers could not be installed.
///
/// # Example
///
/// ```text
/// tokio::select! {
///     result = signals::wait_for_termination() => result?,
///     _ = handle.wait_for_stop() => {}
/// }
/// handle.shutdown().await?;
/// ```
pub async fn wait_for_termination() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

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
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}
