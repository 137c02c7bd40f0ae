//! TLS termination and remote unwrapping.
//!
//! The relay either acts as a TLS server toward the client
//! ([`TlsMode::TerminateLocally`]) or as a TLS client toward the remote
//! ([`TlsMode::UnwrapRemote`]), never both.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use serde::{Deserialize, Serialize};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};

/// Where, if anywhere, the relay speaks TLS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    #[default]
    None,
    TerminateLocally,
    UnwrapRemote,
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsMode::None => f.write_str("none"),
            TlsMode::TerminateLocally => f.write_str("terminate-locally"),
            TlsMode::UnwrapRemote => f.write_str("unwrap-remote"),
        }
    }
}

/// PEM material handed to the relay core. The core never reads files.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    /// Certificate chain, may also carry the private key
    pub cert_pem: Vec<u8>,
    /// Private key, when kept in a separate file
    pub key_pem: Option<Vec<u8>>,
    /// Extra trust anchors for the remote, added to the webpki roots
    pub remote_ca_pem: Option<Vec<u8>>,
    /// Accept any remote certificate
    pub insecure_skip_verify: bool,
}

/// Per-mode TLS state shared by all sessions
#[derive(Clone)]
pub enum TlsContext {
    Plain,
    TerminateLocally(TlsAcceptor),
    UnwrapRemote(TlsConnector),
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TlsContext").field(&self.mode()).finish()
    }
}

impl TlsContext {
    /// Build the TLS context for `mode`.
    ///
    /// Fails when terminating locally without a usable certificate and key.
    pub fn build(mode: TlsMode, material: &TlsMaterial) -> RelayResult<Self> {
        match mode {
            TlsMode::None => Ok(TlsContext::Plain),
            TlsMode::TerminateLocally => {
                let acceptor = build_acceptor(&material.cert_pem, material.key_pem.as_deref())?;
                Ok(TlsContext::TerminateLocally(acceptor))
            }
            TlsMode::UnwrapRemote => {
                let connector = build_connector(
                    material.remote_ca_pem.as_deref(),
                    material.insecure_skip_verify,
                )?;
                Ok(TlsContext::UnwrapRemote(connector))
            }
        }
    }

    pub fn mode(&self) -> TlsMode {
        match self {
            TlsContext::Plain => TlsMode::None,
            TlsContext::TerminateLocally(_) => TlsMode::TerminateLocally,
            TlsContext::UnwrapRemote(_) => TlsMode::UnwrapRemote,
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM blob
pub fn parse_certificates(pem: &[u8]) -> RelayResult<Vec<CertificateDer<'static>>> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RelayError::config(format!("failed to parse PEM certificates: {}", e)))?;
    Ok(certs)
}

/// Parse the first private key in a PEM blob
pub fn parse_private_key(pem: &[u8]) -> RelayResult<Option<PrivateKeyDer<'static>>> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RelayError::config(format!("failed to parse PEM private key: {}", e)))
}

/// Build the acceptor used to terminate client TLS
pub fn build_acceptor(cert_pem: &[u8], key_pem: Option<&[u8]>) -> RelayResult<TlsAcceptor> {
    if cert_pem.is_empty() {
        return Err(RelayError::config(
            "TLS termination enabled but no certificate provided",
        ));
    }

    let certs = parse_certificates(cert_pem)?;
    if certs.is_empty() {
        return Err(RelayError::config("no certificates found in PEM data"));
    }

    let key = match key_pem {
        Some(pem) => parse_private_key(pem)?,
        None => parse_private_key(cert_pem)?,
    }
    .ok_or_else(|| RelayError::config("no private key found for TLS certificate"))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::config(format!("unsupported TLS protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::config(format!("failed to build TLS server config: {}", e)))?;

    info!("Loaded TLS certificate chain for local termination");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the connector used to unwrap remote TLS
pub fn build_connector(extra_ca_pem: Option<&[u8]>, insecure: bool) -> RelayResult<TlsConnector> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::config(format!("unsupported TLS protocol versions: {}", e)))?;

    let config = if insecure {
        warn!("Remote certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider())))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(pem) = extra_ca_pem {
            let certs = parse_certificates(pem)?;
            if certs.is_empty() {
                return Err(RelayError::config("no certificates found in remote CA bundle"));
            }
            let (added, ignored) = roots.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!("Ignored {} unparsable certificate(s) in remote CA bundle", ignored);
            }
            debug!("Added {} remote CA certificate(s)", added);
        }

        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Turn a remote host into the name presented for SNI and verification
pub fn server_name(host: &str) -> RelayResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| RelayError::config(format!("invalid TLS server name '{}': {}", host, e)))
}

/// Verifier for `--insecure`: signatures are still checked, the chain and
/// name are not.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
