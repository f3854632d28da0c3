//! Shutdown Handling
//!
//! Translates SIGTERM/SIGINT into a broadcast the supervisor loop listens to.
//! The loop stops at its next wait point; pending snippet changes are not drained.

use crate::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Shutdown coordinator broadcasting a single stop signal
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    /// Get a shutdown receiver; subscribe before the signal can fire
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast the shutdown signal without waiting for an OS signal
    pub fn trigger(&self) {
        match self.shutdown_tx.send(()) {
            Ok(receivers) => debug!(receivers, "Shutdown signal broadcast"),
            Err(e) => warn!("Failed to send shutdown signal: {}", e),
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then broadcast shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        debug!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, shutting down");
        }

        self.trigger();
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
