//! Tapline - a TLS-intercepting CONNECT proxy that captures HTTP transactions
//!
//! Clients open tunnels with `CONNECT host:port`. When a CA is configured the
//! proxy terminates the client's TLS with a certificate minted for the host,
//! opens its own TLS session to the origin, and parses the plaintext HTTP/1.x
//! flowing through the tunnel. Every completed request/response pair is handed
//! to the registered [`ContentObserver`]s.
//!
//! # Features
//!
//! - **Destination policy**: allow-list and deny-list of `host:port` targets
//! - **HTTPS interception**: per-host certificates signed by a user-provided CA
//! - **Transaction capture**: streaming HTTP/1.x parsing with keep-alive and
//!   pipelining, decoded response bodies, form and query parameters
//! - **Observer isolation**: observers run on the blocking pool; a failing or
//!   panicking observer never affects the relay or other observers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapline::{CapturedRequest, CapturedResponse, Config, ContentObserver, ObserverError, ProxyServer};
//!
//! struct PrintStatus;
//!
//! impl ContentObserver for PrintStatus {
//!     fn interested(&self, request: &CapturedRequest) -> bool {
//!         request.path().starts_with("/api/")
//!     }
//!
//!     fn accept(&self, request: &CapturedRequest, response: &CapturedResponse) -> Result<(), ObserverError> {
//!         println!("{} {} -> {}", request.method(), request.uri(), response.status());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.toml")?;
//!     let server = ProxyServer::new(config)?.with_observer(Arc::new(PrintStatus));
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
//!     server.run_until_shutdown(shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod capture;
pub mod config;
pub mod error;
pub mod policy;
pub mod proxy;
#[doc(hidden)]
pub mod test_support;
pub mod tls;

pub use audit::AuditLogger;
pub use capture::{
    CapturedRequest, CapturedResponse, ContentObserver, ObserverError, TransactionDispatcher,
};
pub use config::Config;
pub use error::{Error, Result};
pub use proxy::{ConnectContext, ProxyServer};
pub use tls::{
    CertificateAuthority, GeneratedCa, HandshakeErrorCounter, HandshakeObserver,
    MitmCertificateGenerator,
};
