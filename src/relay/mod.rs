//! Data Relay Module
//!
//! Owns one client/remote pair per session and pumps bytes both ways.

pub mod engine;
pub mod pump;
pub mod session;

pub use engine::{RelayEngine, RelaySettings, RemoteTarget};
pub use pump::{DirectionalPump, PumpEnd, PumpOptions, PumpOutcome};
pub use session::{RelaySession, SessionCounter, SessionLink, SessionReport};

/// Direction of travel through a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToRemote,
    RemoteToClient,
}

impl Direction {
    pub fn arrow(self) -> &'static str {
        match self {
            Direction::ClientToRemote => ">>>",
            Direction::RemoteToClient => "<<<",
        }
    }

    pub fn verb(self) -> &'static str {
        match self {
            Direction::ClientToRemote => "sent",
            Direction::RemoteToClient => "received",
        }
    }

    /// Peer the pump reads from
    pub fn source(self) -> &'static str {
        match self {
            Direction::ClientToRemote => "client",
            Direction::RemoteToClient => "remote",
        }
    }

    /// Peer the pump writes to
    pub fn destination(self) -> &'static str {
        match self {
            Direction::ClientToRemote => "remote",
            Direction::RemoteToClient => "client",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.arrow())
    }
}
