//! Main proxy server

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use super::connect::{ConnectDispatcher, ConnectHandler, TransparentConnectHandler, TunnelSettings};
use super::handler::ProxyHandler;
use crate::audit::AuditLogger;
use crate::capture::{ContentObserver, LoggingObserver, TransactionDispatcher};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::policy::{BasicAuth, DestinationPolicy, PatternSet};
use crate::tls::{
    CertificateAuthority, HandshakeErrorCounter, HandshakeObserver, Interception,
    MitmCertificateGenerator, RustlsTransport,
};

/// The main proxy server
pub struct ProxyServer {
    config: Config,
    mitm_generator: Option<Arc<MitmCertificateGenerator>>,
    intercept_hosts: PatternSet,
    resolved_auth: Option<(String, String)>,
    audit_logger: Option<Arc<AuditLogger>>,
    observers: Vec<Arc<dyn ContentObserver>>,
    handshake_observers: Vec<Arc<dyn HandshakeObserver>>,
    handshake_errors: Arc<HandshakeErrorCounter>,
    upstream_tls_config: Option<Arc<ClientConfig>>,
    listener: Option<TcpListener>,
}

impl ProxyServer {
    /// Create a new proxy server from configuration
    ///
    /// Without `ca_cert`/`ca_key` the proxy still runs, relaying tunnels
    /// without decrypting them.
    pub fn new(config: Config) -> Result<Self> {
        let mitm_generator = match (&config.proxy.ca_cert, &config.proxy.ca_key) {
            (Some(cert), Some(key)) => {
                let ca = CertificateAuthority::from_files(cert, key)?;
                Some(Arc::new(MitmCertificateGenerator::new(ca)))
            }
            _ => {
                tracing::info!("No CA configured, tunnels are relayed without interception");
                None
            }
        };

        let intercept_hosts = PatternSet::hosts(&config.proxy.intercept_hosts)?;

        // Resolve auth credentials at startup (expands ${ENV_VAR})
        let resolved_auth = config.resolved_auth()?;

        let audit_logger = match &config.logging.audit_log {
            Some(path) => Some(Arc::new(AuditLogger::open(path).map_err(|e| {
                Error::config(format!("Cannot open audit log '{}': {}", path, e))
            })?)),
            None => None,
        };

        let mut observers: Vec<Arc<dyn ContentObserver>> = Vec::new();
        if config.capture.log_transactions {
            let paths = PatternSet::paths(&config.capture.log_paths)?;
            observers.push(Arc::new(LoggingObserver::new(paths)));
        }

        tracing::info!(
            interception = mitm_generator.is_some(),
            intercept_hosts = intercept_hosts.len(),
            allow = config.policy.allow.len(),
            deny = config.policy.deny.len(),
            auth = resolved_auth.is_some(),
            capture = config.capture.enabled,
            "Proxy configured"
        );

        Ok(Self {
            config,
            mitm_generator,
            intercept_hosts,
            resolved_auth,
            audit_logger,
            observers,
            handshake_observers: Vec::new(),
            handshake_errors: Arc::new(HandshakeErrorCounter::new()),
            upstream_tls_config: None,
            listener: None,
        })
    }

    /// Register a content observer; observers run in registration order
    pub fn with_observer(mut self, observer: Arc<dyn ContentObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_handshake_observer(mut self, observer: Arc<dyn HandshakeObserver>) -> Self {
        self.handshake_observers.push(observer);
        self
    }

    /// Replace the upstream TLS client config built from `upstream_tls`
    pub fn with_upstream_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.upstream_tls_config = Some(config);
        self
    }

    /// Client-facing handshake outcomes so far
    pub fn handshake_errors(&self) -> Arc<HandshakeErrorCounter> {
        Arc::clone(&self.handshake_errors)
    }

    /// Run the proxy server with graceful shutdown
    pub async fn run_until_shutdown(
        mut self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let local_addr = self.bind().await?;
        tracing::info!(address = %local_addr, "Proxy server listening");
        self.serve(shutdown).await
    }

    /// Bind the server to its configured address and return the local address.
    ///
    /// Useful when binding to port 0 to discover the assigned port. Call
    /// `serve()` afterwards to start accepting connections.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let bind_address = &self.config.proxy.bind_address;
        let addr: SocketAddr = bind_address.parse().map_err(|e| {
            Error::config(format!("Invalid bind address '{}': {}", bind_address, e))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::proxy(format!("Failed to get local address: {}", e)))?;

        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Serve connections using a previously bound listener, with graceful shutdown.
    pub async fn serve(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::proxy("bind() must be called before serve()"))?;
        let handler = self.build_handler()?;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(
                        handshake_failures = self.handshake_errors.failures(),
                        handshakes = self.handshake_errors.successes(),
                        "Shutdown signal received"
                    );
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    tracing::debug!(client = %client_addr, "New connection");
                    spawn_connection(stream, client_addr, handler.clone());
                }
            }
        }
    }

    /// Assemble the handler chain: intercepting first, transparent fallback
    fn build_handler(&self) -> Result<ProxyHandler> {
        let transport = match &self.upstream_tls_config {
            Some(client_config) => {
                RustlsTransport::new(self.mitm_generator.clone(), Arc::clone(client_config))
            }
            None => RustlsTransport::from_config(&self.config.proxy, self.mitm_generator.clone())?,
        };

        let mut interception = Interception::new(Arc::new(transport), self.intercept_hosts.clone())
            .with_handshake_observer(self.handshake_errors.clone());
        for observer in &self.handshake_observers {
            interception = interception.with_handshake_observer(Arc::clone(observer));
        }

        let settings = TunnelSettings::from_config(&self.config.proxy);
        let policy = Arc::new(DestinationPolicy::from_config(&self.config.policy));
        let log_connects = self.config.logging.log_connects;

        let mut primary =
            ConnectDispatcher::new(Arc::new(interception), Arc::clone(&policy), settings.clone())
                .with_audit_logger(self.audit_logger.clone())
                .with_connect_logging(log_connects);
        if let Some((user, pass)) = &self.resolved_auth {
            primary = primary.with_authenticator(Arc::new(BasicAuth::new(user, pass)));
        }
        if self.config.capture.enabled {
            primary = primary.with_transactions(Arc::new(TransactionDispatcher::new(
                self.observers.clone(),
            )));
        }

        let fallback = TransparentConnectHandler::new(policy, settings)
            .with_audit_logger(self.audit_logger.clone())
            .with_connect_logging(log_connects);

        Ok(ProxyHandler::new(vec![
            Arc::new(primary) as Arc<dyn ConnectHandler>,
            Arc::new(fallback) as Arc<dyn ConnectHandler>,
        ]))
    }

    /// Get the bind address
    pub fn bind_address(&self) -> &str {
        &self.config.proxy.bind_address
    }

    pub fn mitm_generator(&self) -> Option<&Arc<MitmCertificateGenerator>> {
        self.mitm_generator.as_ref()
    }
}

/// Spawn a task to handle a single connection.
fn spawn_connection(stream: TcpStream, client_addr: SocketAddr, handler: ProxyHandler) {
    tokio::spawn(async move {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let handler = handler.clone();
            async move { handler.handle(req, client_addr).await }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            if !e.is_incomplete_message() {
                tracing::debug!(client = %client_addr, error = %e, "Connection error");
            }
        }
    });
}
