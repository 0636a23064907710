//! Waiting for SIGTERM or SIGINT.

use tokio::signal;
use tracing::{info, warn};

/// Resolve once the process is asked to stop (SIGTERM or Ctrl+C).
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal as unix_signal};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM signal");
                    }
                    result = signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!("Failed to listen for Ctrl+C: {}", e);
                        }
                        info!("Received SIGINT signal (Ctrl+C)");
                    }
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT signal (Ctrl+C)"),
        Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
    }
}
