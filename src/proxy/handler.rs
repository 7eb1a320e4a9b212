//! Entry point for every request on an accepted proxy connection

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Method, Request, Response};

use super::connect::{ConnectHandler, ConnectOutcome};
use super::response::{not_implemented_response, ProxyBody};

/// Offers each CONNECT to a chain of handlers until one answers
pub struct ProxyHandler<B = Incoming>
where
    B: Send + 'static,
{
    chain: Arc<[Arc<dyn ConnectHandler<B>>]>,
}

impl<B> Clone for ProxyHandler<B>
where
    B: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
        }
    }
}

impl<B> ProxyHandler<B>
where
    B: Send + 'static,
{
    pub fn new(chain: Vec<Arc<dyn ConnectHandler<B>>>) -> Self {
        Self {
            chain: chain.into(),
        }
    }

    /// Handle an incoming proxy request
    ///
    /// Only CONNECT is served. Anything else, and a CONNECT every handler
    /// delegated, gets 501.
    pub async fn handle(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        if req.method() != Method::CONNECT {
            tracing::debug!(
                client = %client_addr,
                method = %req.method(),
                uri = %req.uri(),
                "Rejecting non-CONNECT request"
            );
            return Ok(not_implemented_response(req.method().as_str()));
        }

        let mut req = req;
        for handler in self.chain.iter() {
            match handler.handle_connect(req, client_addr).await {
                ConnectOutcome::Handled(resp) => return Ok(resp),
                ConnectOutcome::Delegate(returned) => {
                    tracing::trace!(handler = handler.name(), "Handler delegated CONNECT");
                    req = returned;
                }
            }
        }

        tracing::info!(
            client = %client_addr,
            authority = %req.uri(),
            "No handler accepted CONNECT"
        );
        Ok(not_implemented_response("CONNECT"))
    }
}
