//! Drives both pumps of a tunnel on one task

use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{Instant, Sleep};

use super::buffer::BufferPool;
use super::context::ConnectContext;
use super::pump::{Direction, FailureKind, Pump, StreamObserver};
use crate::tls::BoxedIo;

/// Byte counts and outcome of a finished tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_server: u64,
    pub server_to_client: u64,
    pub failure: Option<FailureKind>,
}

/// A client-facing and a server-facing endpoint joined by two pumps
///
/// Requests flow downstream → upstream, responses the other way. When either
/// pump fails, or nothing moves for the idle timeout, both legs close with
/// the same cause.
pub struct Tunnel {
    context: Arc<ConnectContext>,
    downstream: BoxedIo,
    upstream: BoxedIo,
    requests: Pump,
    responses: Pump,
    idle_timeout: Duration,
}

impl Tunnel {
    pub fn new(
        context: Arc<ConnectContext>,
        downstream: BoxedIo,
        upstream: BoxedIo,
        pool: Arc<BufferPool>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            context,
            downstream,
            upstream,
            requests: Pump::new(Direction::ClientToServer, Arc::clone(&pool)),
            responses: Pump::new(Direction::ServerToClient, pool),
            idle_timeout,
        }
    }

    /// Attach protocol observers to the request and response pumps
    pub fn with_capture(
        mut self,
        requests: Box<dyn StreamObserver>,
        responses: Box<dyn StreamObserver>,
    ) -> Self {
        self.requests = self.requests.with_observer(requests);
        self.responses = self.responses.with_observer(responses);
        self
    }

    pub async fn run(self) -> TunnelStats {
        let Tunnel {
            context,
            mut downstream,
            mut upstream,
            mut requests,
            mut responses,
            idle_timeout,
        } = self;

        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);
        let mut last_moved = 0u64;

        let result = poll_fn(|cx| {
            poll_tunnel(
                cx,
                &mut requests,
                &mut responses,
                &mut downstream,
                &mut upstream,
                idle.as_mut(),
                idle_timeout,
                &mut last_moved,
            )
        })
        .await;

        let failure = match &result {
            Ok(()) => {
                requests.close(None);
                responses.close(None);
                None
            }
            Err(e) => {
                let kind = FailureKind::classify(e);
                match kind {
                    FailureKind::TimedOut => {
                        tracing::debug!(authority = %context.authority(), "Tunnel idle, closing")
                    }
                    FailureKind::AlreadyClosed => tracing::debug!(
                        authority = %context.authority(),
                        error = %e,
                        "Tunnel peer already closed"
                    ),
                    FailureKind::Io => tracing::warn!(
                        authority = %context.authority(),
                        client = %context.client_addr(),
                        error = %e,
                        "Tunnel I/O failed"
                    ),
                }
                requests.close(Some(e));
                responses.close(Some(e));
                Some(kind)
            }
        };

        let stats = TunnelStats {
            client_to_server: requests.transferred(),
            server_to_client: responses.transferred(),
            failure,
        };
        tracing::debug!(
            authority = %context.authority(),
            client_to_server = stats.client_to_server,
            server_to_client = stats.server_to_client,
            "Tunnel closed"
        );
        stats
    }
}

#[allow(clippy::too_many_arguments)]
fn poll_tunnel(
    cx: &mut Context<'_>,
    requests: &mut Pump,
    responses: &mut Pump,
    downstream: &mut BoxedIo,
    upstream: &mut BoxedIo,
    mut idle: Pin<&mut Sleep>,
    idle_timeout: Duration,
    last_moved: &mut u64,
) -> Poll<io::Result<()>> {
    if !requests.is_closed() {
        if let Poll::Ready(Err(e)) = requests.poll_advance(cx, &mut **downstream, &mut **upstream)
        {
            return Poll::Ready(Err(e));
        }
    }
    if !responses.is_closed() {
        if let Poll::Ready(Err(e)) = responses.poll_advance(cx, &mut **upstream, &mut **downstream)
        {
            return Poll::Ready(Err(e));
        }
    }
    if requests.is_closed() && responses.is_closed() {
        return Poll::Ready(Ok(()));
    }

    let moved = requests.transferred() + responses.transferred();
    if moved != *last_moved {
        *last_moved = moved;
        idle.as_mut().reset(Instant::now() + idle_timeout);
    }
    if idle.as_mut().poll(cx).is_ready() {
        return Poll::Ready(Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "no traffic within the idle timeout",
        )));
    }
    Poll::Pending
}
