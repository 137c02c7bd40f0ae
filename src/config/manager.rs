//! Configuration Manager

use super::Config;
use crate::tls::{TlsMaterial, TlsMode};
use crate::Result;
use anyhow::{bail, Context};
use std::path::{Path, PathBuf};

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to environment variables
    /// when the file does not exist.
    pub fn load(path: &Path) -> Result<Config> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!("Config file {} not found, checking environment variables", path.display());
            Self::load_from_env()
        }
    }

    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(local_addr) = std::env::var("TCPRELAY_LOCAL_ADDR") {
            config.listener.local_addr = local_addr;
        }

        if let Ok(remote_addr) = std::env::var("TCPRELAY_REMOTE_ADDR") {
            config.listener.remote_addr = remote_addr;
        }

        if let Ok(match_expr) = std::env::var("TCPRELAY_MATCH") {
            config.transform.match_expr = match_expr;
        }

        if let Ok(replace_expr) = std::env::var("TCPRELAY_REPLACE") {
            config.transform.replace_expr = replace_expr;
        }

        if let Ok(timeout) = std::env::var("TCPRELAY_CONNECT_TIMEOUT") {
            config.relay.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TCPRELAY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(log_level) = std::env::var("TCPRELAY_LOG_LEVEL") {
            config.output.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Read the PEM files named by the TLS configuration.
    ///
    /// Only files the selected mode needs are read.
    pub fn read_tls_material(config: &Config) -> Result<TlsMaterial> {
        let tls = &config.tls;
        let mut material = TlsMaterial {
            insecure_skip_verify: tls.insecure_skip_verify,
            ..Default::default()
        };

        match tls.mode {
            TlsMode::None => {}
            TlsMode::TerminateLocally => {
                let cert_path = tls
                    .cert_path
                    .as_deref()
                    .context("TLS enabled but no certificate provided")?;
                material.cert_pem = read_pem(cert_path, "certificate")?;
                if let Some(key_path) = &tls.key_path {
                    material.key_pem = Some(read_pem(key_path, "private key")?);
                }
            }
            TlsMode::UnwrapRemote => {
                if let Some(ca_path) = &tls.remote_ca_path {
                    material.remote_ca_pem = Some(read_pem(ca_path, "remote CA bundle")?);
                }
            }
        }

        Ok(material)
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Could not read {} from {}", what, path.display()))?;
    if pem.is_empty() {
        bail!("{} file {} is empty", what, path.display());
    }
    tracing::info!("Loaded {} from {}", what, path.display());
    Ok(pem)
}

/// Values supplied on the command line, applied over file and environment
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
    pub match_expr: Option<String>,
    pub replace_expr: Option<String>,
    pub terminate_tls: bool,
    pub unwrap_tls: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub remote_ca_path: Option<PathBuf>,
    pub insecure: bool,
    pub verbose: bool,
    pub very_verbose: bool,
    pub no_delay: bool,
    pub hex: bool,
    pub color: bool,
    pub log_level: Option<String>,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_listener_config()
            .with_context(|| "Listener configuration validation failed")?;

        self.validate_tls_config()
            .with_context(|| "TLS configuration validation failed")?;

        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_output_config()
            .with_context(|| "Output configuration validation failed")?;

        Ok(())
    }

    fn validate_listener_config(&self) -> Result<()> {
        if self.listener.local_addr.is_empty() {
            bail!("local_addr must not be empty");
        }

        if self.listener.remote_addr.is_empty() {
            bail!("remote_addr must not be empty");
        }

        if !self.listener.remote_addr.contains(':') {
            bail!("remote_addr must be in host:port form");
        }

        Ok(())
    }

    fn validate_tls_config(&self) -> Result<()> {
        match self.tls.mode {
            TlsMode::TerminateLocally => {
                if self.tls.cert_path.is_none() {
                    bail!("TLS termination requires a certificate (cert_path)");
                }
            }
            TlsMode::UnwrapRemote => {
                if self.tls.key_path.is_some() {
                    tracing::warn!("key_path is ignored when unwrapping remote TLS");
                }
            }
            TlsMode::None => {}
        }

        if self.tls.insecure_skip_verify && self.tls.mode != TlsMode::UnwrapRemote {
            tracing::warn!("insecure_skip_verify only applies when unwrapping remote TLS");
        }

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.buffer_size < 512 {
            bail!("buffer_size must be at least 512 bytes");
        }

        if self.relay.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.relay.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_output_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.output.log_level.as_str()) {
            bail!("log_level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments.
    ///
    /// Terminating and unwrapping TLS at the same time is rejected.
    pub fn merge_with_cli_args(&mut self, cli: CliOverrides) -> Result<()> {
        if cli.terminate_tls && cli.unwrap_tls {
            bail!("--tls and --unwrap-tls are mutually exclusive");
        }

        if let Some(local_addr) = cli.local_addr {
            tracing::info!("CLI override: local address set to {}", local_addr);
            self.listener.local_addr = local_addr;
        }

        if let Some(remote_addr) = cli.remote_addr {
            tracing::info!("CLI override: remote address set to {}", remote_addr);
            self.listener.remote_addr = remote_addr;
        }

        if let Some(match_expr) = cli.match_expr {
            self.transform.match_expr = match_expr;
        }

        if let Some(replace_expr) = cli.replace_expr {
            self.transform.replace_expr = replace_expr;
        }

        if cli.terminate_tls {
            self.tls.mode = TlsMode::TerminateLocally;
        } else if cli.unwrap_tls {
            self.tls.mode = TlsMode::UnwrapRemote;
        }

        if cli.cert_path.is_some() {
            self.tls.cert_path = cli.cert_path;
        }
        if cli.key_path.is_some() {
            self.tls.key_path = cli.key_path;
        }
        if cli.remote_ca_path.is_some() {
            self.tls.remote_ca_path = cli.remote_ca_path;
        }

        self.tls.insecure_skip_verify |= cli.insecure;
        self.output.verbose |= cli.verbose;
        self.output.very_verbose |= cli.very_verbose;
        self.output.no_delay |= cli.no_delay;
        self.output.hex |= cli.hex;
        self.output.color |= cli.color;

        if let Some(log_level) = cli.log_level {
            self.output.log_level = log_level;
        }

        Ok(())
    }

    /// Effective log filter after applying the verbosity switches
    pub fn effective_log_level(&self) -> String {
        crate::logging::level_for(
            &self.output.log_level,
            self.output.verbose,
            self.output.very_verbose,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listener.local_addr, ":9999");
        assert_eq!(config.listener.remote_addr, "localhost:80");
        assert_eq!(config.relay.buffer_size, 0xffff);
        assert_eq!(config.tls.mode, TlsMode::None);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[listener]
local_addr = "127.0.0.1:7000"
remote_addr = "db.internal:5432"

[transform]
match = "SELECT .*"
replace = "foo~bar"

[relay]
connect_timeout = "3s"
half_close = false
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.listener.local_addr, "127.0.0.1:7000");
        assert_eq!(config.listener.remote_addr, "db.internal:5432");
        assert_eq!(config.transform.match_expr, "SELECT .*");
        assert_eq!(config.transform.replace_expr, "foo~bar");
        assert_eq!(config.relay.connect_timeout, Duration::from_secs(3));
        assert!(!config.relay.half_close);
        assert_eq!(config.relay.buffer_size, 0xffff);
    }

    #[test]
    fn test_terminate_without_cert_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tls]\nmode = \"terminate-locally\"").unwrap();
        assert!(ConfigManager::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_cli_rejects_both_tls_modes() {
        let mut config = Config::default();
        let result = config.merge_with_cli_args(CliOverrides {
            terminate_tls: true,
            unwrap_tls: true,
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut config = Config::default();
        config
            .merge_with_cli_args(CliOverrides {
                local_addr: Some("127.0.0.1:1234".into()),
                remote_addr: Some("example.com:443".into()),
                unwrap_tls: true,
                insecure: true,
                hex: true,
                very_verbose: true,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.listener.local_addr, "127.0.0.1:1234");
        assert_eq!(config.tls.mode, TlsMode::UnwrapRemote);
        assert!(config.tls.insecure_skip_verify);
        assert!(config.output.hex);
        assert_eq!(config.effective_log_level(), "trace");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.relay.buffer_size = 16;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.output.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.listener.remote_addr = "nohost".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_read_tls_material_for_termination() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        write!(cert, "-----BEGIN CERTIFICATE-----\n").unwrap();

        let mut config = Config::default();
        config.tls.mode = TlsMode::TerminateLocally;
        config.tls.cert_path = Some(cert.path().to_path_buf());

        let material = ConfigManager::read_tls_material(&config).unwrap();
        assert!(!material.cert_pem.is_empty());
        assert!(material.key_pem.is_none());
    }

    #[test]
    fn test_read_tls_material_missing_file() {
        let mut config = Config::default();
        config.tls.mode = TlsMode::TerminateLocally;
        config.tls.cert_path = Some(PathBuf::from("/nonexistent/cert.pem"));
        assert!(ConfigManager::read_tls_material(&config).is_err());
    }

    #[test]
    fn test_plain_mode_reads_nothing() {
        let mut config = Config::default();
        config.tls.cert_path = Some(PathBuf::from("/nonexistent/cert.pem"));
        let material = ConfigManager::read_tls_material(&config).unwrap();
        assert!(material.cert_pem.is_empty());
    }
}
