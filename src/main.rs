//! tcprelay - Transparent TCP Relay
//!
//! Listens on a local port, forwards every accepted connection to a fixed
//! remote endpoint, and optionally inspects, rewrites, dumps or TLS-wraps the
//! traffic on the way through.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tracing::{error, info, warn};

use tcprelay::{
    config::{CliOverrides, ConfigManager},
    logging, ConnectionManager, ShutdownCoordinator,
};

/// CLI arguments for tcprelay
#[derive(Parser, Debug)]
#[command(name = "tcprelay")]
#[command(about = "tcprelay - Transparent TCP relay with inspection and rewriting")]
#[command(version)]
#[command(long_about = "
tcprelay - Transparent TCP relay with inspection and rewriting

Every connection accepted on the local address is relayed to the remote
address. Traffic can be matched against a regular expression, rewritten with
a `pattern~replacement` expression, hex dumped, and TLS terminated locally or
unwrapped towards the remote.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TCPRELAY_LOCAL_ADDR        - Local address (e.g., :9999)
  TCPRELAY_REMOTE_ADDR       - Remote address (e.g., localhost:80)
  TCPRELAY_MATCH             - Regular expression to report
  TCPRELAY_REPLACE           - Rewrite expression (pattern~replacement)
  TCPRELAY_CONNECT_TIMEOUT   - Remote dial timeout (e.g., 10s)
  TCPRELAY_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(long, default_value = "tcprelay.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    #[arg(short, long, help = "Local address (e.g., :9999)")]
    pub local: Option<String>,

    #[arg(short, long, help = "Remote address (e.g., localhost:80)")]
    pub remote: Option<String>,

    /// Sets log level to debug
    #[arg(short, long, help = "Display server actions")]
    pub verbose: bool,

    /// Sets log level to trace
    #[arg(long = "vv", help = "Display server actions and all tcp data")]
    pub very_verbose: bool,

    #[arg(short = 'n', long = "nagle", help = "Disable Nagle's algorithm")]
    pub no_delay: bool,

    #[arg(short = 'x', long, help = "Output hex")]
    pub hex: bool,

    #[arg(short, long, help = "Output ansi colors")]
    pub color: bool,

    #[arg(long = "tls", help = "Terminate TLS from clients locally")]
    pub terminate_tls: bool,

    #[arg(long, help = "Connect to the remote over TLS and relay plaintext")]
    pub unwrap_tls: bool,

    #[arg(long, help = "PEM certificate (and optionally key) used with --tls")]
    pub cert: Option<PathBuf>,

    #[arg(long, help = "PEM private key used with --tls")]
    pub key: Option<PathBuf>,

    #[arg(long, help = "Extra PEM CA bundle trusted for the remote with --unwrap-tls")]
    pub remote_ca: Option<PathBuf>,

    #[arg(long, help = "Skip remote certificate verification with --unwrap-tls")]
    pub insecure: bool,

    #[arg(long = "match", help = "Match regex (e.g., 'user=(.*)')")]
    pub match_expr: Option<String>,

    #[arg(long = "replace", help = "Replace regex (e.g., 'user=(.*)~user=admin')")]
    pub replace_expr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            local_addr: self.local.clone(),
            remote_addr: self.remote.clone(),
            match_expr: self.match_expr.clone(),
            replace_expr: self.replace_expr.clone(),
            terminate_tls: self.terminate_tls,
            unwrap_tls: self.unwrap_tls,
            cert_path: self.cert.clone(),
            key_path: self.key.clone(),
            remote_ca_path: self.remote_ca.clone(),
            insecure: self.insecure,
            verbose: self.verbose,
            very_verbose: self.very_verbose,
            no_delay: self.no_delay,
            hex: self.hex,
            color: self.color,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = ConfigManager::load(&args.config)?;
    config.merge_with_cli_args(args.overrides())?;

    // Final validation after all overrides
    config
        .validate()
        .context("Final configuration validation failed")?;

    // Verbosity and colour may come from the file, so tracing starts here
    logging::init_tracing(&config.effective_log_level(), config.output.color)?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Local address: {}", config.listener.local_addr);
        info!("  Remote address: {}", config.listener.remote_addr);
        info!("  TLS mode: {}", config.tls.mode);
        info!("  Buffer size: {} bytes", config.relay.buffer_size);
        info!("  Half close: {}", config.relay.half_close);
        info!("  Connect timeout: {:?}", config.relay.connect_timeout);
        if !config.transform.match_expr.is_empty() {
            info!("  Match: {}", config.transform.match_expr);
        }
        if !config.transform.replace_expr.is_empty() {
            info!("  Replace: {}", config.transform.replace_expr);
        }
        return Ok(());
    }

    info!("Starting tcprelay v{}", env!("CARGO_PKG_VERSION"));

    let material = ConfigManager::read_tls_material(&config)?;
    let connection_manager = ConnectionManager::bind(&config, &material).await?;
    let connections = connection_manager.handle();

    let shutdown_coordinator = ShutdownCoordinator::new(config.relay.shutdown_timeout);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = connection_manager.run().await {
            error!("Server error: {}", e);
        }
    });

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    info!("Initiating graceful shutdown...");
    let remaining = shutdown_coordinator.shutdown_connections(&connections).await;

    if let Err(e) = server_handle.await {
        if !e.is_cancelled() {
            error!("Server task failed: {}", e);
        }
    }

    if remaining > 0 {
        warn!("Exiting with {} sessions still open", remaining);
    }

    info!(
        "Server shutdown complete ({} sessions served)",
        connections.engine().sessions_started()
    );

    Ok(())
}
