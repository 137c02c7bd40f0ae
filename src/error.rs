//! Relay Error Types

use std::net::SocketAddr;
use std::time::Duration;

/// Which end of a session a TLS handshake was performed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSide {
    Client,
    Remote,
}

impl std::fmt::Display for PeerSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerSide::Client => f.write_str("client"),
            PeerSide::Remote => f.write_str("remote"),
        }
    }
}

/// Errors raised by the relay core.
///
/// Only `Configuration` is ever fatal to the process, and only during setup.
/// Every other variant ends at most one session.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("TLS handshake with {side} failed: {source}")]
    Handshake {
        side: PeerSide,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to remote {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to remote {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
}

impl RelayError {
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Configuration(msg.into())
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_error_names_side() {
        let err = RelayError::Handshake {
            side: PeerSide::Remote,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "bad certificate"),
        };
        assert_eq!(
            err.to_string(),
            "TLS handshake with remote failed: bad certificate"
        );
    }

    #[test]
    fn test_configuration_error_message() {
        let err = RelayError::config("no certificate provided");
        assert_eq!(err.to_string(), "configuration error: no certificate provided");
    }
}
