//! TLS and certificate management

mod ca;
mod cache;
mod interception;
mod mitm;
mod transport;

pub use ca::{CertificateAuthority, GeneratedCa};
pub use cache::CertificateCache;
pub use interception::{HandshakeErrorCounter, HandshakeObserver, InterceptedLegs, Interception};
pub use mitm::MitmCertificateGenerator;
pub use transport::{
    client_config_with_ca, trust_all_client_config, webpki_client_config, AsyncIo, BoxedIo,
    RustlsTransport, TlsTransport, WrapError,
};
