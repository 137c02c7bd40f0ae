//! tcprelay Library
//!
//! Transparent TCP relay with optional TLS termination or unwrapping,
//! regex inspection and rewriting of the relayed bytes, and hex or coloured
//! traffic dumps.

pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod relay;
pub mod shutdown;
pub mod tls;
pub mod transform;

pub use config::Config;
pub use connection::{ConnectionHandle, ConnectionManager};
pub use error::RelayError;
pub use relay::RelayEngine;
pub use shutdown::ShutdownCoordinator;
pub use transform::TransformPipeline;

/// Common error type for setup and the binary
pub type Result<T> = anyhow::Result<T>;
