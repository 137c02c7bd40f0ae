//! Configuration Types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::tls::TlsMode;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub tls: TlsConfig,
    pub transform: TransformConfig,
    pub relay: RelayConfig,
    pub output: OutputConfig,
}

/// Local and remote endpoints
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address to listen on, `:port` binds every interface
    pub local_addr: String,
    /// Remote `host:port` every session is relayed to
    pub remote_addr: String,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub mode: TlsMode,
    /// PEM certificate chain for local termination, may include the key
    pub cert_path: Option<PathBuf>,
    /// PEM private key when not bundled with the certificate
    pub key_path: Option<PathBuf>,
    /// Extra CA bundle trusted when unwrapping remote TLS
    pub remote_ca_path: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

/// Match and replace expressions
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Regex whose matches are logged
    #[serde(rename = "match")]
    pub match_expr: String,
    /// `regex~replacement` applied to every chunk
    #[serde(rename = "replace")]
    pub replace_expr: String,
}

/// Relay engine tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub buffer_size: usize,
    /// Let the other direction drain after one side sends EOF
    pub half_close: bool,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Grace period for in-flight sessions on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Output and socket switches
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    pub log_level: String,
    pub verbose: bool,
    pub very_verbose: bool,
    /// Disable Nagle's algorithm
    pub no_delay: bool,
    pub hex: bool,
    pub color: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            local_addr: ":9999".to_string(),
            remote_addr: "localhost:80".to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 0xffff,
            half_close: true,
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            verbose: false,
            very_verbose: false,
            no_delay: false,
            hex: false,
            color: false,
        }
    }
}
