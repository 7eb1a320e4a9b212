//! Server-side TLS contexts minted per intercepted host

use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;

use super::ca::CertificateAuthority;
use super::cache::CertificateCache;
use crate::error::{Error, Result};

/// Builds (and caches) a rustls server config for each host the proxy
/// impersonates
pub struct MitmCertificateGenerator {
    ca: CertificateAuthority,
    cache: CertificateCache,
}

impl std::fmt::Debug for MitmCertificateGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmCertificateGenerator")
            .field("cached_hosts", &self.cache.len())
            .finish()
    }
}

impl MitmCertificateGenerator {
    pub fn new(ca: CertificateAuthority) -> Self {
        Self {
            ca,
            cache: CertificateCache::default(),
        }
    }

    /// Server config presenting a certificate for `host`
    ///
    /// Only `http/1.1` is offered over ALPN, so clients never switch the
    /// tunnel to HTTP/2.
    pub fn server_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.to_ascii_lowercase();
        if let Some(config) = self.cache.get(&host) {
            tracing::trace!(host = %host, "Using cached server config");
            return Ok(config);
        }

        tracing::debug!(host = %host, "Minting certificate");
        let (leaf, key) = self.ca.issue_leaf(&host)?;
        let chain = vec![leaf, self.ca.cert_der().clone()];
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Error::tls(format!("Failed to build server config for {}: {}", host, e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.cache.insert(host, Arc::clone(&config));
        Ok(config)
    }

    /// CA certificate clients must trust
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        self.ca.cert_der()
    }

    pub fn cached_hosts(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_report;
    use crate::tls::ca::GeneratedCa;

    fn generator() -> MitmCertificateGenerator {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let generated = GeneratedCa::generate().unwrap();
        let ca = CertificateAuthority::from_pem(&generated.cert_pem, &generated.key_pem).unwrap();
        MitmCertificateGenerator::new(ca)
    }

    #[test]
    fn test_alpn_http11_only() {
        let t = test_report!("Minted server config offers only http/1.1");
        let gen = generator();
        let config = gen.server_config_for_host("a.example").unwrap();
        t.assert_eq("alpn", &config.alpn_protocols, &vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_config_cached_per_host() {
        let t = test_report!("Server configs are cached per host, case-insensitively");
        let gen = generator();
        let first = gen.server_config_for_host("a.example").unwrap();
        let again = gen.server_config_for_host("A.Example").unwrap();
        t.assert_true("same config", Arc::ptr_eq(&first, &again));

        gen.server_config_for_host("b.example").unwrap();
        t.assert_eq("hosts", &gen.cached_hosts(), &2usize);
    }
}
