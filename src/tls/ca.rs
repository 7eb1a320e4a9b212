//! Signing identity for intercepted connections

use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::{Error, Result};

const CA_COMMON_NAME: &str = "Tapline Proxy CA";

/// Lifetime of minted leaf certificates
const LEAF_VALIDITY_DAYS: i64 = 1;

/// A freshly generated CA in PEM form
pub struct GeneratedCa {
    pub cert_pem: String,
    pub key_pem: String,
}

impl GeneratedCa {
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Tapline");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(3650);

        let key_pair = KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(e.to_string()))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Write both files; the key file is made owner-only on Unix
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        let (cert_path, key_path) = (cert_path.as_ref(), key_path.as_ref());
        std::fs::write(cert_path, &self.cert_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write certificate to '{}': {}",
                cert_path.display(),
                e
            ))
        })?;
        std::fs::write(key_path, &self.key_pem).map_err(|e| {
            Error::certificate(format!("Failed to write key to '{}': {}", key_path.display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(key_path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(key_path, perms)?;
        }
        Ok(())
    }
}

/// Loaded CA used to sign per-host server certificates
pub struct CertificateAuthority {
    key_pair: KeyPair,
    /// The CA rebuilt from its own PEM so issued leaves name it exactly
    issuer: rcgen::Certificate,
    cert_der: CertificateDer<'static>,
}

impl CertificateAuthority {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::certificate(format!("Failed to parse CA private key: {}", e)))?;

        let cert_der = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .next()
            .ok_or_else(|| Error::certificate("No certificate found in CA PEM"))?
            .map_err(|e| Error::certificate(format!("Failed to read CA certificate: {}", e)))?;

        let issuer = CertificateParams::from_ca_cert_pem(cert_pem)
            .and_then(|params| params.self_signed(&key_pair))
            .map_err(|e| Error::certificate(format!("Failed to load CA for signing: {}", e)))?;

        Ok(Self {
            key_pair,
            issuer,
            cert_der,
        })
    }

    pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let (cert_path, key_path) = (cert_path.as_ref(), key_path.as_ref());
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA certificate '{}': {}",
                cert_path.display(),
                e
            ))
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            Error::certificate(format!("Failed to read CA key '{}': {}", key_path.display(), e))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Mint a short-lived server certificate for `host`
    ///
    /// IP literals get an IP SAN, anything else a DNS SAN.
    pub fn issue_leaf(
        &self,
        host: &str,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.try_into().map_err(|e| {
                Error::certificate(format!("Invalid hostname '{}': {}", host, e))
            })?),
        };

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, host);
        params.subject_alt_names = vec![san];
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::minutes(5);
        params.not_after = params.not_before + time::Duration::days(LEAF_VALIDITY_DAYS);

        let leaf_key = KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
        let cert = params
            .signed_by(&leaf_key, &self.issuer, &self.key_pair)
            .map_err(|e| Error::certificate(format!("Failed to sign certificate: {}", e)))?;

        Ok((
            CertificateDer::from(cert.der().to_vec()),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        ))
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}
