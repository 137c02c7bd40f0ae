//! Relay Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::engine::{RelaySettings, RemoteTarget};
use super::pump::{DirectionalPump, PumpOptions, PumpOutcome};
use super::Direction;
use crate::error::{PeerSide, RelayError, RelayResult};
use crate::tls::{self, TlsContext};
use crate::transform::TransformPipeline;

/// Process-wide session id source. Ids start at 1 and never repeat.
#[derive(Debug, Default)]
pub struct SessionCounter(AtomicU64);

impl SessionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of ids handed out so far
    pub fn issued(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// State shared by the two pumps of one session: the closed flag and the
/// per-direction byte counters.
#[derive(Debug)]
pub struct SessionLink {
    closed: AtomicBool,
    signal: watch::Sender<bool>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Default for SessionLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLink {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            closed: AtomicBool::new(false),
            signal,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Mark the session closed and wake the pumps.
    ///
    /// Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.signal.send_replace(true);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    pub fn record(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::ClientToRemote => &self.bytes_sent,
            Direction::RemoteToClient => &self.bytes_received,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes forwarded client to remote
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes forwarded remote to client
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// Summary emitted once when a session ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: u64,
    pub client_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub duration_ms: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Set when the session ended before relaying (connect or handshake failure)
    pub error: Option<String>,
}

impl SessionReport {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One accepted client connection and everything needed to relay it
pub struct RelaySession {
    pub session_id: u64,
    pub client_addr: SocketAddr,
    pub local_addr: SocketAddr,
    client: TcpStream,
    remote: Arc<RemoteTarget>,
    settings: Arc<RelaySettings>,
    pipeline: Arc<TransformPipeline>,
    link: Arc<SessionLink>,
    start_time: Instant,
}

impl RelaySession {
    /// Create a new relay session. Nothing touches the network until `run`.
    pub fn new(
        session_id: u64,
        client: TcpStream,
        client_addr: SocketAddr,
        local_addr: SocketAddr,
        remote: Arc<RemoteTarget>,
        settings: Arc<RelaySettings>,
        pipeline: Arc<TransformPipeline>,
    ) -> Self {
        debug!(
            "Creating relay session #{:03} ({} -> {})",
            session_id, client_addr, remote.addr
        );

        Self {
            session_id,
            client_addr,
            local_addr,
            client,
            remote,
            settings,
            pipeline,
            link: Arc::new(SessionLink::new()),
            start_time: Instant::now(),
        }
    }

    /// Drive the session to full teardown and report how it went.
    ///
    /// Never fails: connect and handshake errors end up in the report.
    pub async fn run(self) -> SessionReport {
        let span = info_span!("session", id = self.session_id);
        let RelaySession {
            session_id,
            client_addr,
            local_addr,
            client,
            remote,
            settings,
            pipeline,
            link,
            start_time,
        } = self;

        async move {
            info!("Opened {} >>> {} (via {})", client_addr, remote, local_addr);

            let result = establish(client, &remote, &settings, &pipeline, &link).await;
            if let Err(e) = &result {
                warn!("Session aborted: {}", e);
            }

            link.close();

            let report = SessionReport {
                session_id,
                client_addr,
                remote_addr: remote.addr,
                duration_ms: start_time.elapsed().as_millis() as u64,
                bytes_sent: link.bytes_sent(),
                bytes_received: link.bytes_received(),
                error: result.err().map(|e| e.to_string()),
            };

            info!(
                "Closed ({} bytes sent, {} bytes received, {:?})",
                report.bytes_sent,
                report.bytes_received,
                Duration::from_millis(report.duration_ms)
            );
            debug!(report = %report.to_json(), "Relay session completed");

            report
        }
        .instrument(span)
        .await
    }
}

/// Perform the TLS setup for the configured mode, connect the remote and
/// relay until both directions are done.
async fn establish(
    client: TcpStream,
    remote: &RemoteTarget,
    settings: &Arc<RelaySettings>,
    pipeline: &Arc<TransformPipeline>,
    link: &Arc<SessionLink>,
) -> RelayResult<()> {
    if settings.no_delay {
        if let Err(e) = client.set_nodelay(true) {
            warn!("Failed to disable Nagle on client socket: {}", e);
        }
    }

    match &settings.tls {
        TlsContext::Plain => {
            let upstream = connect_remote(remote, settings).await?;
            relay(client, upstream, settings, pipeline, link).await;
        }
        TlsContext::TerminateLocally(acceptor) => {
            let client = acceptor
                .accept(client)
                .await
                .map_err(|source| RelayError::Handshake {
                    side: PeerSide::Client,
                    source,
                })?;
            info!("TLS handshake with client completed");

            let upstream = connect_remote(remote, settings).await?;
            relay(client, upstream, settings, pipeline, link).await;
        }
        TlsContext::UnwrapRemote(connector) => {
            let name = tls::server_name(&remote.host)?;
            let upstream = connect_remote(remote, settings).await?;
            let upstream = connector
                .connect(name, upstream)
                .await
                .map_err(|source| RelayError::Handshake {
                    side: PeerSide::Remote,
                    source,
                })?;
            info!("TLS handshake with remote {} completed", remote.host);

            relay(client, upstream, settings, pipeline, link).await;
        }
    }

    Ok(())
}

async fn connect_remote(remote: &RemoteTarget, settings: &RelaySettings) -> RelayResult<TcpStream> {
    let addr = remote.addr;
    let stream = match timeout(settings.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(RelayError::Connect { addr, source }),
        Err(_) => {
            return Err(RelayError::ConnectTimeout {
                addr,
                timeout: settings.connect_timeout,
            })
        }
    };

    if settings.no_delay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to disable Nagle on remote socket: {}", e);
        }
    }

    debug!("Connected to remote {}", addr);
    Ok(stream)
}

/// Run both pumps as independent tasks and wait for both to finish.
///
/// The streams are dropped, and therefore closed, when the pumps return.
async fn relay<C, R>(
    client: C,
    remote: R,
    settings: &Arc<RelaySettings>,
    pipeline: &Arc<TransformPipeline>,
    link: &Arc<SessionLink>,
) where
    C: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (remote_read, remote_write) = tokio::io::split(remote);
    let options = PumpOptions::from(settings.as_ref());

    let upstream = DirectionalPump::new(
        Direction::ClientToRemote,
        client_read,
        remote_write,
        Arc::clone(pipeline),
        Arc::clone(link),
        options,
    );
    let downstream = DirectionalPump::new(
        Direction::RemoteToClient,
        remote_read,
        client_write,
        Arc::clone(pipeline),
        Arc::clone(link),
        options,
    );

    let span = tracing::Span::current();
    let up = tokio::spawn(upstream.run().instrument(span.clone()));
    let down = tokio::spawn(downstream.run().instrument(span));

    let (up, down) = tokio::join!(up, down);
    for result in [up, down] {
        match result {
            Ok(PumpOutcome { direction, bytes, end }) => {
                debug!("{} pump finished after {} bytes: {}", direction, bytes, end);
            }
            Err(e) => {
                error!("Pump task failed: {}", e);
                link.close();
            }
        }
    }
}
