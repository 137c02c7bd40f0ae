//! Relay Engine

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::{lookup_host, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::session::{RelaySession, SessionCounter, SessionReport};
use crate::config::Config;
use crate::tls::{TlsContext, TlsMaterial};
use crate::transform::TransformPipeline;
use crate::Result;

/// Configuration snapshot handed to every session
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub tls: TlsContext,
    /// Disable Nagle's algorithm on both sockets
    pub no_delay: bool,
    pub hex: bool,
    pub color: bool,
    pub buffer_size: usize,
    pub half_close: bool,
    pub connect_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            tls: TlsContext::Plain,
            no_delay: false,
            hex: false,
            color: false,
            buffer_size: 0xffff,
            half_close: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RelaySettings {
    /// Build relay settings from configuration and pre-read TLS material.
    ///
    /// Fails on TLS configuration errors so they surface once, at startup.
    pub fn from_config(config: &Config, material: &TlsMaterial) -> Result<Self> {
        let tls = TlsContext::build(config.tls.mode, material)
            .context("Failed to set up TLS")?;

        Ok(Self {
            tls,
            no_delay: config.output.no_delay,
            hex: config.output.hex,
            color: config.output.color,
            buffer_size: config.relay.buffer_size,
            half_close: config.relay.half_close,
            connect_timeout: config.relay.connect_timeout,
        })
    }
}

/// Remote endpoint resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Host as configured, used for TLS server name
    pub host: String,
    pub port: u16,
    pub addr: SocketAddr,
}

impl RemoteTarget {
    /// Split a `host:port` string. An empty host means localhost and IPv6
    /// hosts may be bracketed.
    pub fn parse(remote: &str) -> Result<(String, u16)> {
        let (host, port) = remote
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Remote address '{}' must be in host:port form", remote))?;

        let port = port
            .parse::<u16>()
            .with_context(|| format!("Invalid port in remote address '{}'", remote))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { "localhost" } else { host };

        Ok((host.to_string(), port))
    }

    /// Resolve a `host:port` string to the first address it maps to
    pub async fn resolve(remote: &str) -> Result<Self> {
        let (host, port) = Self::parse(remote)?;

        debug!("Resolving remote address: {}:{}", host, port);
        let addr = lookup_host((host.as_str(), port))
            .await
            .with_context(|| format!("Failed to resolve remote address {}", remote))?
            .next()
            .ok_or_else(|| anyhow!("DNS resolution returned no addresses for {}", host))?;

        debug!("Resolved {} to {}", remote, addr);
        Ok(Self { host, port, addr })
    }

    /// Target with a known address, no lookup involved
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            addr,
        }
    }

    /// Override the name used for TLS verification
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host == self.addr.ip().to_string() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}:{} ({})", self.host, self.port, self.addr)
        }
    }
}

/// Builds and runs relay sessions for one listener
pub struct RelayEngine {
    settings: Arc<RelaySettings>,
    pipeline: Arc<TransformPipeline>,
    remote: Arc<RemoteTarget>,
    local_addr: SocketAddr,
    session_ids: Arc<SessionCounter>,
    active_sessions: Arc<AtomicUsize>,
}

impl RelayEngine {
    /// Create a new relay engine
    pub fn new(
        settings: RelaySettings,
        pipeline: TransformPipeline,
        remote: RemoteTarget,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            pipeline: Arc::new(pipeline),
            remote: Arc::new(remote),
            local_addr,
            session_ids: Arc::new(SessionCounter::new()),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn pipeline(&self) -> &Arc<TransformPipeline> {
        &self.pipeline
    }

    /// Wrap an accepted connection in a session with a fresh id
    pub fn create_session(&self, client: TcpStream, client_addr: SocketAddr) -> RelaySession {
        RelaySession::new(
            self.session_ids.next_id(),
            client,
            client_addr,
            self.local_addr,
            Arc::clone(&self.remote),
            Arc::clone(&self.settings),
            Arc::clone(&self.pipeline),
        )
    }

    /// Run a session for an accepted connection as its own task
    pub fn spawn_session(&self, client: TcpStream, client_addr: SocketAddr) -> JoinHandle<SessionReport> {
        let session = self.create_session(client, client_addr);
        let guard = ActiveSession::enter(Arc::clone(&self.active_sessions));

        debug!("Spawning session #{:03} for {}", session.session_id, client_addr);
        tokio::spawn(async move {
            let _guard = guard;
            session.run().await
        })
    }

    /// Sessions currently running
    pub fn active_session_count(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Sessions created since startup
    pub fn sessions_started(&self) -> u64 {
        self.session_ids.issued()
    }

    pub fn log_summary(&self) {
        info!(
            "Relaying to {} (tls: {}, match: {}, replace: {})",
            self.remote,
            self.settings.tls.mode(),
            self.pipeline.inspector().map(|i| i.pattern()).unwrap_or("-"),
            self.pipeline.mutator().map(|m| m.pattern()).unwrap_or("-"),
        );
    }
}

/// Keeps the active session count accurate even if a session task panics
struct ActiveSession(Arc<AtomicUsize>);

impl ActiveSession {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            RemoteTarget::parse("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(RemoteTarget::parse(":80").unwrap(), ("localhost".to_string(), 80));
        assert_eq!(RemoteTarget::parse("[::1]:8443").unwrap(), ("::1".to_string(), 8443));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(RemoteTarget::parse("no-port").is_err());
        assert!(RemoteTarget::parse("host:notaport").is_err());
        assert!(RemoteTarget::parse("host:70000").is_err());
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let target = RemoteTarget::resolve("127.0.0.1:9000").await.unwrap();
        assert_eq!(target.addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(target.host, "127.0.0.1");
        assert_eq!(target.to_string(), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let target = RemoteTarget::resolve("localhost:9000").await.unwrap();
        assert!(target.addr.ip().is_loopback());
        assert_eq!(target.host, "localhost");
    }

    #[test]
    fn test_from_addr_with_host() {
        let target = RemoteTarget::from_addr("127.0.0.1:443".parse().unwrap()).with_host("localhost");
        assert_eq!(target.host, "localhost");
        assert_eq!(target.port, 443);
        assert_eq!(target.to_string(), "localhost:443 (127.0.0.1:443)");
    }
}
