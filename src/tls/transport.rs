//! TLS capability used by the interception layer
//!
//! Everything above this module works on [`BoxedIo`] and never sees a TLS
//! type. [`RustlsTransport`] is the shipped implementation.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::mitm::MitmCertificateGenerator;
use crate::config::{ProxyConfig, UpstreamTrust};
use crate::error::{Error, Result};

/// A bidirectional byte stream, plain or encrypted
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

pub type BoxedIo = Box<dyn AsyncIo>;

/// Why a leg could not be wrapped
#[derive(thiserror::Error)]
pub enum WrapError {
    /// No TLS context for this leg; the untouched stream is handed back
    #[error("TLS unavailable: {reason}")]
    Unavailable { io: BoxedIo, reason: String },

    /// The handshake itself failed; the stream is gone
    #[error("TLS handshake failed: {0}")]
    Handshake(Error),
}

impl std::fmt::Debug for WrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WrapError::Unavailable { reason, .. } => f
                .debug_struct("Unavailable")
                .field("reason", reason)
                .finish_non_exhaustive(),
            WrapError::Handshake(e) => f.debug_tuple("Handshake").field(e).finish(),
        }
    }
}

/// Wraps a leg of a tunnel in TLS
#[async_trait]
pub trait TlsTransport: Send + Sync {
    /// A signing identity exists for the client-facing role
    fn has_server_identity(&self) -> bool;

    /// Terminate the client's TLS, presenting an identity for `host`
    async fn wrap_as_server(
        &self,
        io: BoxedIo,
        host: &str,
    ) -> std::result::Result<BoxedIo, WrapError>;

    /// Open TLS towards the origin, announcing `sni_host`
    async fn wrap_as_client(
        &self,
        io: BoxedIo,
        sni_host: &str,
    ) -> std::result::Result<BoxedIo, WrapError>;
}

/// [`TlsTransport`] backed by rustls
pub struct RustlsTransport {
    generator: Option<Arc<MitmCertificateGenerator>>,
    client_config: Arc<ClientConfig>,
}

impl RustlsTransport {
    pub fn new(
        generator: Option<Arc<MitmCertificateGenerator>>,
        client_config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            generator,
            client_config,
        }
    }

    /// Build from the proxy section of the config
    pub fn from_config(
        config: &ProxyConfig,
        generator: Option<Arc<MitmCertificateGenerator>>,
    ) -> Result<Self> {
        let client_config = match &config.upstream_tls_ca {
            Some(path) => client_config_with_ca(path)?,
            None => match config.upstream_tls {
                UpstreamTrust::TrustAll => trust_all_client_config(),
                UpstreamTrust::Webpki => webpki_client_config(),
            },
        };
        Ok(Self::new(generator, client_config))
    }
}

#[async_trait]
impl TlsTransport for RustlsTransport {
    fn has_server_identity(&self) -> bool {
        self.generator.is_some()
    }

    async fn wrap_as_server(
        &self,
        io: BoxedIo,
        host: &str,
    ) -> std::result::Result<BoxedIo, WrapError> {
        let Some(generator) = &self.generator else {
            return Err(WrapError::Unavailable {
                io,
                reason: "no CA configured".to_string(),
            });
        };
        let config = match generator.server_config_for_host(host) {
            Ok(config) => config,
            Err(e) => {
                return Err(WrapError::Unavailable {
                    io,
                    reason: e.to_string(),
                })
            }
        };

        let stream = TlsAcceptor::from(config)
            .accept(io)
            .await
            .map_err(|e| WrapError::Handshake(Error::tls(format!("client handshake: {}", e))))?;
        Ok(Box::new(stream))
    }

    async fn wrap_as_client(
        &self,
        io: BoxedIo,
        sni_host: &str,
    ) -> std::result::Result<BoxedIo, WrapError> {
        let server_name = match ServerName::try_from(sni_host.to_string()) {
            Ok(name) => name,
            Err(e) => {
                return Err(WrapError::Unavailable {
                    io,
                    reason: format!("invalid server name '{}': {}", sni_host, e),
                })
            }
        };

        let stream = TlsConnector::from(Arc::clone(&self.client_config))
            .connect(server_name, io)
            .await
            .map_err(|e| {
                WrapError::Handshake(Error::tls(format!("upstream handshake with {}: {}", sni_host, e)))
            })?;
        Ok(Box::new(stream))
    }
}

fn provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn finish_client_config(mut config: ClientConfig) -> Arc<ClientConfig> {
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Client config that accepts any upstream certificate
///
/// Destinations are already vetted by the CONNECT policy, and upstreams are
/// often reached by IP or through internal names.
pub fn trust_all_client_config() -> Arc<ClientConfig> {
    let verifier = AcceptAnyServerCert {
        provider: provider(),
    };
    finish_client_config(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth(),
    )
}

/// Client config trusting the Mozilla root set
pub fn webpki_client_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    finish_client_config(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Client config trusting only the CAs in a PEM file
pub fn client_config_with_ca(path: impl AsRef<Path>) -> Result<Arc<ClientConfig>> {
    let path = path.as_ref();
    let pem = std::fs::read(path).map_err(|e| {
        Error::certificate(format!("Failed to read upstream CA '{}': {}", path.display(), e))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .collect::<std::io::Result<Vec<CertificateDer<'static>>>>()
        .map_err(|e| Error::certificate(format!("Invalid upstream CA PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::certificate(format!(
            "No certificate found in '{}'",
            path.display()
        )));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| Error::certificate(format!("Unusable upstream CA: {}", e)))?;
    }
    Ok(finish_client_config(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}

/// Skips chain and name checks but still verifies handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
