//! Connection Manager Implementation

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::RelayError;
use crate::relay::{RelayEngine, RelaySettings, RemoteTarget};
use crate::tls::TlsMaterial;
use crate::transform::TransformPipeline;
use crate::Result;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts client connections and hands each one to the relay engine
pub struct ConnectionManager {
    listener: TcpListener,
    handle: ConnectionHandle,
    shutdown_rx: broadcast::Receiver<()>,
}

/// Cloneable control handle for a running [`ConnectionManager`]
#[derive(Clone)]
pub struct ConnectionHandle {
    engine: Arc<RelayEngine>,
    local_addr: SocketAddr,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    /// Resolve the remote, build TLS and the transform pipeline, and bind
    /// the listening socket.
    ///
    /// Every error here is a setup error and fatal to the process.
    pub async fn bind(config: &Config, material: &TlsMaterial) -> Result<Self> {
        let settings = RelaySettings::from_config(config, material)?;
        let pipeline = TransformPipeline::build(
            &config.transform.match_expr,
            &config.transform.replace_expr,
        );

        let remote = RemoteTarget::resolve(&config.listener.remote_addr)
            .await
            .context("Failed to resolve remote address")?;

        let bind_addr = normalize_local_addr(&config.listener.local_addr);
        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to open local port to listen on {}", bind_addr))?;

        let local_addr = listener.local_addr()?;
        info!("Successfully bound to {}", local_addr);

        let engine = RelayEngine::new(settings, pipeline, remote, local_addr);
        Ok(Self::with_engine(listener, engine))
    }

    /// Wrap an already bound listener
    pub fn with_engine(listener: TcpListener, engine: RelayEngine) -> Self {
        let local_addr = listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Self {
            listener,
            shutdown_rx,
            handle: ConnectionHandle {
                engine: Arc::new(engine),
                local_addr,
                shutdown_flag: Arc::new(AtomicBool::new(false)),
                shutdown_tx,
            },
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    /// Main connection acceptance loop.
    ///
    /// Returns after shutdown is initiated; the listening socket is closed on
    /// return while in-flight sessions keep running.
    pub async fn run(self) -> Result<()> {
        let ConnectionManager {
            listener,
            handle,
            mut shutdown_rx,
        } = self;

        handle.engine.log_summary();
        info!("Starting connection acceptance loop on {}", handle.local_addr);

        loop {
            if handle.is_shutting_down() {
                info!("Shutdown flag set, stopping connection acceptance");
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);

                            if handle.is_shutting_down() {
                                debug!("Rejecting connection from {} due to shutdown", addr);
                                continue;
                            }

                            handle.engine.spawn_session(stream, addr);
                        }
                        Err(e) => {
                            error!("{}", RelayError::Accept(e));
                            // A single bad accept must not stop the service
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    handle.shutdown_flag.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }

        drop(listener);
        info!("Connection acceptance loop stopped, listener closed");
        Ok(())
    }
}

impl ConnectionHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    /// Number of sessions still relaying
    pub fn active_sessions(&self) -> usize {
        self.engine.active_session_count()
    }

    /// Stop accepting new connections
    pub fn initiate_shutdown(&self) {
        info!("Initiating shutdown of connection manager");
        self.shutdown_flag.store(true, Ordering::Relaxed);

        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No acceptance loop listening for shutdown: {}", e);
        }
    }

    /// Check if shutdown has been initiated
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Wait up to `grace` for in-flight sessions to finish on their own.
    ///
    /// Returns the number of sessions still active afterwards.
    pub async fn wait_for_sessions_to_close(&self, grace: Duration) -> usize {
        let start_time = Instant::now();

        info!(
            "Waiting for {} active sessions to close (timeout: {:?})",
            self.active_sessions(),
            grace
        );

        while self.active_sessions() > 0 && start_time.elapsed() < grace {
            debug!("Waiting for {} active sessions to close", self.active_sessions());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.active_sessions();
        let elapsed = start_time.elapsed();

        if remaining == 0 {
            info!("All sessions closed in {:?}", elapsed);
        } else {
            warn!(
                "Shutdown grace period elapsed after {:?} with {} sessions still active",
                elapsed, remaining
            );
        }

        remaining
    }
}

/// `:port` means every interface
fn normalize_local_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_local_addr() {
        assert_eq!(normalize_local_addr(":9999"), "0.0.0.0:9999");
        assert_eq!(normalize_local_addr("127.0.0.1:80"), "127.0.0.1:80");
        assert_eq!(normalize_local_addr("localhost:80"), "localhost:80");
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let mut config = Config::default();
        config.listener.local_addr = "127.0.0.1:0".into();
        config.listener.remote_addr = "127.0.0.1:9".into();

        let manager = ConnectionManager::bind(&config, &TlsMaterial::default())
            .await
            .unwrap();
        let addr = manager.local_addr();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert_eq!(manager.handle().active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_bind_fails_on_missing_certificate() {
        let mut config = Config::default();
        config.listener.local_addr = "127.0.0.1:0".into();
        config.tls.mode = crate::tls::TlsMode::TerminateLocally;

        assert!(ConnectionManager::bind(&config, &TlsMaterial::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_acceptance_loop() {
        let mut config = Config::default();
        config.listener.local_addr = "127.0.0.1:0".into();
        config.listener.remote_addr = "127.0.0.1:9".into();

        let manager = ConnectionManager::bind(&config, &TlsMaterial::default())
            .await
            .unwrap();
        let handle = manager.handle();
        let addr = manager.local_addr();
        let server = tokio::spawn(manager.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.initiate_shutdown();

        let result = tokio::time::timeout(Duration::from_secs(1), server).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
        assert!(handle.is_shutting_down());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        assert_eq!(handle.wait_for_sessions_to_close(Duration::from_millis(10)).await, 0);
    }
}
