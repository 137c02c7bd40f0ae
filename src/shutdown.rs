//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT, stops the acceptance loop and gives in-flight
//! sessions a grace period before the process exits.

use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::connection::ConnectionHandle;
use crate::Result;

/// Shutdown coordinator that manages the shutdown sequence
pub struct ShutdownCoordinator {
    /// Grace period for in-flight sessions
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Wait for a shutdown signal (SIGTERM, SIGINT)
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating shutdown");
        }

        Ok(())
    }

    /// Stop accepting and wait out the grace period for active sessions.
    ///
    /// Sessions still running afterwards are not killed; they end with the
    /// process.
    pub async fn shutdown_connections(&self, connections: &ConnectionHandle) -> usize {
        connections.initiate_shutdown();
        connections.wait_for_sessions_to_close(self.timeout).await
    }
}
