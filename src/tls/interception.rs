//! Decides, per tunnel leg, whether bytes are decrypted
//!
//! The client-facing leg is wrapped first; the server-facing leg is only
//! wrapped when the client-facing one was, otherwise the client's own TLS
//! would be tunnelled into a second TLS session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::transport::{BoxedIo, TlsTransport, WrapError};
use crate::error::{Error, Result};
use crate::policy::PatternSet;
use crate::proxy::ConnectContext;

/// Notified about each client-facing handshake
pub trait HandshakeObserver: Send + Sync {
    fn on_handshake_complete(&self, _authority: &str, _client: SocketAddr) {}

    fn on_handshake_failure(&self, authority: &str, client: SocketAddr, error: &Error);
}

/// Counts client-facing handshake outcomes
#[derive(Debug, Default)]
pub struct HandshakeErrorCounter {
    failures: AtomicU64,
    successes: AtomicU64,
}

impl HandshakeErrorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }
}

impl HandshakeObserver for HandshakeErrorCounter {
    fn on_handshake_complete(&self, _authority: &str, _client: SocketAddr) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn on_handshake_failure(&self, _authority: &str, _client: SocketAddr, _error: &Error) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Both legs of a tunnel after the interception decision
pub struct InterceptedLegs {
    pub downstream: BoxedIo,
    pub upstream: BoxedIo,
    /// The client-facing leg is terminated here and the bytes are plaintext
    pub decrypted: bool,
}

pub struct Interception {
    transport: Arc<dyn TlsTransport>,
    hosts: PatternSet,
    handshake_observers: Vec<Arc<dyn HandshakeObserver>>,
}

impl Interception {
    /// `hosts` limits which hosts the signing identity covers; empty covers all
    pub fn new(transport: Arc<dyn TlsTransport>, hosts: PatternSet) -> Self {
        Self {
            transport,
            hosts,
            handshake_observers: Vec::new(),
        }
    }

    pub fn with_handshake_observer(mut self, observer: Arc<dyn HandshakeObserver>) -> Self {
        self.handshake_observers.push(observer);
        self
    }

    pub fn has_server_identity(&self) -> bool {
        self.transport.has_server_identity()
    }

    /// The signing identity can impersonate `host`
    pub fn matches_host(&self, host: &str) -> bool {
        self.has_server_identity() && self.hosts.matches(host)
    }

    /// Wrap both legs as far as the available TLS contexts allow
    ///
    /// A missing context leaves the leg plain. A failed handshake is an error
    /// and the caller drops the tunnel.
    pub async fn intercept(
        &self,
        downstream: BoxedIo,
        upstream: BoxedIo,
        ctx: &ConnectContext,
    ) -> Result<InterceptedLegs> {
        let host = ctx.host();
        let authority = ctx.authority();

        let downstream = match self.transport.wrap_as_server(downstream, host).await {
            Ok(io) => {
                for observer in &self.handshake_observers {
                    observer.on_handshake_complete(authority, ctx.client_addr());
                }
                io
            }
            Err(WrapError::Unavailable { io, reason }) => {
                tracing::warn!(
                    host = %host,
                    reason = %reason,
                    "No server TLS context, relaying without interception"
                );
                return Ok(InterceptedLegs {
                    downstream: io,
                    upstream,
                    decrypted: false,
                });
            }
            Err(WrapError::Handshake(e)) => {
                tracing::warn!(
                    authority = %authority,
                    client = %ctx.client_addr(),
                    error = %e,
                    "Client TLS handshake failed"
                );
                for observer in &self.handshake_observers {
                    observer.on_handshake_failure(authority, ctx.client_addr(), &e);
                }
                return Err(e);
            }
        };

        let upstream = match self.transport.wrap_as_client(upstream, host).await {
            Ok(io) => io,
            Err(WrapError::Unavailable { io, reason }) => {
                tracing::warn!(
                    host = %host,
                    reason = %reason,
                    "No client TLS context, upstream leg stays plain"
                );
                io
            }
            Err(WrapError::Handshake(e)) => {
                tracing::warn!(
                    authority = %authority,
                    client = %ctx.client_addr(),
                    error = %e,
                    "Upstream TLS handshake failed"
                );
                return Err(e);
            }
        };

        tracing::debug!(authority = %authority, "Tunnel intercepted");
        Ok(InterceptedLegs {
            downstream,
            upstream,
            decrypted: true,
        })
    }
}

impl std::fmt::Debug for Interception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interception")
            .field("server_identity", &self.has_server_identity())
            .field("hosts", &self.hosts.len())
            .field("handshake_observers", &self.handshake_observers.len())
            .finish()
    }
}
