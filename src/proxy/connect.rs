//! CONNECT handlers: admission, outbound connect, tunnel hand-off

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use super::buffer::BufferPool;
use super::context::ConnectContext;
use super::response::{
    auth_required_response, connect_established, error_response, forbidden_response, ProxyBody,
};
use super::tunnel::Tunnel;
use crate::audit::{AuditDecision, AuditEntry, AuditEvent, AuditLogger, AuditReason};
use crate::capture::{CaptureSession, ProtocolObserver, TransactionDispatcher};
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::policy::{AllowAll, Authenticator, DestinationPolicy, PolicyDecision};
use crate::tls::{BoxedIo, Interception};

const INTERCEPTING: &str = "intercepting";
const TRANSPARENT: &str = "transparent";

/// Result of offering a CONNECT to one handler in the chain
pub enum ConnectOutcome<B = Incoming> {
    Handled(Response<ProxyBody>),
    /// Not for this handler; the next one in the chain gets the request
    Delegate(Request<B>),
}

/// One link in the CONNECT handler chain
#[async_trait]
pub trait ConnectHandler<B = Incoming>: Send + Sync
where
    B: Send + 'static,
{
    /// Short label used in logs and audit entries
    fn name(&self) -> &'static str;

    async fn handle_connect(&self, req: Request<B>, client_addr: SocketAddr) -> ConnectOutcome<B>;
}

/// What the intercepting handler decided before touching the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    /// The signing identity does not cover the host
    Delegate,
    AuthRequired,
    Forbidden(PolicyDecision),
}

/// Knobs shared by every tunnel a handler opens
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub pool: Arc<BufferPool>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl TunnelSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            pool: BufferPool::new(config.buffer_size),
            connect_timeout: config.connect_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// Open the TCP connection to the CONNECT target within `timeout`
pub async fn connect_upstream(ctx: &ConnectContext, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect((ctx.host(), ctx.port()))).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(authority = %ctx.authority(), error = %e, "Failed to set TCP_NODELAY");
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::connect(ctx.authority(), e)),
        Err(_) => Err(Error::connect(
            ctx.authority(),
            io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        )),
    }
}

/// Where CONNECT decisions are reported
#[derive(Clone, Default)]
struct DecisionLog {
    audit: Option<Arc<AuditLogger>>,
    log_connects: bool,
}

impl DecisionLog {
    fn record(&self, entry: AuditEntry) {
        if self.log_connects {
            tracing::info!(
                authority = %entry.authority,
                client = %entry.client,
                handler = entry.handler,
                decision = ?entry.decision,
                reason = ?entry.reason,
                "CONNECT"
            );
        }
        if let Some(audit) = &self.audit {
            audit.log(&entry);
        }
    }
}

/// The primary handler: authenticates, checks policy, intercepts, captures
pub struct ConnectDispatcher {
    authenticator: Arc<dyn Authenticator>,
    policy: Arc<DestinationPolicy>,
    interception: Arc<Interception>,
    transactions: Option<Arc<TransactionDispatcher>>,
    settings: TunnelSettings,
    log: DecisionLog,
}

impl ConnectDispatcher {
    pub fn new(
        interception: Arc<Interception>,
        policy: Arc<DestinationPolicy>,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            authenticator: Arc::new(AllowAll),
            policy,
            interception,
            transactions: None,
            settings,
            log: DecisionLog::default(),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Capture tunnelled HTTP and hand transactions to this dispatcher
    pub fn with_transactions(mut self, transactions: Arc<TransactionDispatcher>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    pub fn with_audit_logger(mut self, logger: Option<Arc<AuditLogger>>) -> Self {
        self.log.audit = logger;
        self
    }

    pub fn with_connect_logging(mut self, enabled: bool) -> Self {
        self.log.log_connects = enabled;
        self
    }

    /// Authentication, certificate pre-check and destination policy, in order
    pub fn admit(&self, ctx: &ConnectContext) -> Admission {
        if !self.authenticator.authenticate(ctx.headers()) {
            return Admission::AuthRequired;
        }
        if self.interception.has_server_identity() && !self.interception.matches_host(ctx.host())
        {
            return Admission::Delegate;
        }
        match self.policy.check(ctx.host(), ctx.port()) {
            PolicyDecision::Allowed => Admission::Proceed,
            rejected => Admission::Forbidden(rejected),
        }
    }

    fn entry(
        &self,
        ctx: &ConnectContext,
        event: AuditEvent,
        decision: AuditDecision,
        reason: AuditReason,
    ) -> AuditEntry {
        AuditEntry::new(
            event,
            ctx.authority(),
            ctx.client_addr(),
            INTERCEPTING,
            decision,
            reason,
        )
    }
}

#[async_trait]
impl<B> ConnectHandler<B> for ConnectDispatcher
where
    B: Send + 'static,
{
    fn name(&self) -> &'static str {
        INTERCEPTING
    }

    async fn handle_connect(&self, req: Request<B>, client_addr: SocketAddr) -> ConnectOutcome<B> {
        let ctx = ConnectContext::from_request(&req, client_addr);

        match self.admit(&ctx) {
            Admission::Proceed => {}
            Admission::AuthRequired => {
                tracing::warn!(client = %client_addr, authority = %ctx.authority(), "Proxy authentication failed");
                self.log.record(self.entry(
                    &ctx,
                    AuditEvent::AuthFailed,
                    AuditDecision::Blocked,
                    AuditReason::AuthFailed,
                ));
                return ConnectOutcome::Handled(auth_required_response());
            }
            Admission::Delegate => {
                tracing::debug!(host = %ctx.host(), "Host not covered by the CA, delegating");
                self.log.record(self.entry(
                    &ctx,
                    AuditEvent::ConnectDelegated,
                    AuditDecision::Delegated,
                    AuditReason::HostNotIntercepted,
                ));
                return ConnectOutcome::Delegate(req);
            }
            Admission::Forbidden(decision) => {
                tracing::info!(client = %client_addr, authority = %ctx.authority(), decision = ?decision, "CONNECT rejected by policy");
                self.log.record(self.entry(
                    &ctx,
                    AuditEvent::ConnectBlocked,
                    AuditDecision::Blocked,
                    decision.into(),
                ));
                return ConnectOutcome::Handled(forbidden_response(ctx.authority()));
            }
        }

        let upstream = match connect_upstream(&ctx, self.settings.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(client = %client_addr, error = %e, "Upstream connect failed");
                self.log.record(
                    self.entry(
                        &ctx,
                        AuditEvent::ConnectFailed,
                        AuditDecision::Blocked,
                        AuditReason::UpstreamUnreachable,
                    )
                    .with_error(&e),
                );
                return ConnectOutcome::Handled(error_response(&e.to_string()));
            }
        };
        self.log.record(self.entry(
            &ctx,
            AuditEvent::ConnectAllowed,
            AuditDecision::Allowed,
            AuditReason::PolicyAllowed,
        ));

        let ctx = Arc::new(ctx);
        let upgrade = hyper::upgrade::on(req);
        let interception = Arc::clone(&self.interception);
        let transactions = self.transactions.clone();
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!(authority = %ctx.authority(), error = %e, "Failed to upgrade connection");
                    return;
                }
            };
            let downstream: BoxedIo = Box::new(TokioIo::new(upgraded));

            // Handshake failures are logged and reported inside `intercept`.
            // Dropping the future on timeout closes both legs.
            let legs = match tokio::time::timeout(
                settings.idle_timeout,
                interception.intercept(downstream, Box::new(upstream), &ctx),
            )
            .await
            {
                Ok(Ok(legs)) => legs,
                Ok(Err(_)) => return,
                Err(_) => {
                    tracing::warn!(
                        authority = %ctx.authority(),
                        client = %ctx.client_addr(),
                        timeout_ms = settings.idle_timeout.as_millis() as u64,
                        "TLS handshake timed out, closing tunnel"
                    );
                    return;
                }
            };

            let mut tunnel = Tunnel::new(
                Arc::clone(&ctx),
                legs.downstream,
                legs.upstream,
                settings.pool,
                settings.idle_timeout,
            );
            if let Some(transactions) = transactions {
                let session = Arc::new(CaptureSession::new(ctx.authority(), transactions));
                tunnel = tunnel.with_capture(
                    Box::new(ProtocolObserver::request(Arc::clone(&session))),
                    Box::new(ProtocolObserver::response(session)),
                );
            }
            tunnel.run().await;
        });

        ConnectOutcome::Handled(connect_established())
    }
}

/// Fallback handler: policy and a plain byte relay, nothing decrypted
pub struct TransparentConnectHandler {
    policy: Arc<DestinationPolicy>,
    settings: TunnelSettings,
    log: DecisionLog,
}

impl TransparentConnectHandler {
    pub fn new(policy: Arc<DestinationPolicy>, settings: TunnelSettings) -> Self {
        Self {
            policy,
            settings,
            log: DecisionLog::default(),
        }
    }

    pub fn with_audit_logger(mut self, logger: Option<Arc<AuditLogger>>) -> Self {
        self.log.audit = logger;
        self
    }

    pub fn with_connect_logging(mut self, enabled: bool) -> Self {
        self.log.log_connects = enabled;
        self
    }
}

#[async_trait]
impl<B> ConnectHandler<B> for TransparentConnectHandler
where
    B: Send + 'static,
{
    fn name(&self) -> &'static str {
        TRANSPARENT
    }

    async fn handle_connect(&self, req: Request<B>, client_addr: SocketAddr) -> ConnectOutcome<B> {
        let ctx = ConnectContext::from_request(&req, client_addr);
        let name = TRANSPARENT;

        let decision = self.policy.check(ctx.host(), ctx.port());
        if !decision.is_allowed() {
            tracing::info!(client = %client_addr, authority = %ctx.authority(), decision = ?decision, "CONNECT rejected by policy");
            self.log.record(AuditEntry::new(
                AuditEvent::ConnectBlocked,
                ctx.authority(),
                client_addr,
                name,
                AuditDecision::Blocked,
                decision.into(),
            ));
            return ConnectOutcome::Handled(forbidden_response(ctx.authority()));
        }

        let upstream = match connect_upstream(&ctx, self.settings.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(client = %client_addr, error = %e, "Upstream connect failed");
                self.log.record(
                    AuditEntry::new(
                        AuditEvent::ConnectFailed,
                        ctx.authority(),
                        client_addr,
                        name,
                        AuditDecision::Blocked,
                        AuditReason::UpstreamUnreachable,
                    )
                    .with_error(&e),
                );
                return ConnectOutcome::Handled(error_response(&e.to_string()));
            }
        };
        self.log.record(AuditEntry::new(
            AuditEvent::ConnectAllowed,
            ctx.authority(),
            client_addr,
            name,
            AuditDecision::Allowed,
            AuditReason::PolicyAllowed,
        ));

        let ctx = Arc::new(ctx);
        let upgrade = hyper::upgrade::on(req);
        let settings = self.settings.clone();
        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!(authority = %ctx.authority(), error = %e, "Failed to upgrade connection");
                    return;
                }
            };
            Tunnel::new(
                Arc::clone(&ctx),
                Box::new(TokioIo::new(upgraded)),
                Box::new(upstream),
                settings.pool,
                settings.idle_timeout,
            )
            .run()
            .await;
        });

        ConnectOutcome::Handled(connect_established())
    }
}
