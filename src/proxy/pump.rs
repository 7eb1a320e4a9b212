//! One direction of a tunnel: read from one endpoint, write to the other
//!
//! A [`Pump`] does not own either endpoint. The tunnel driver polls it with
//! the reader and writer for its direction, and the pump advances an explicit
//! state machine as far as readiness allows. That keeps it testable against
//! mock streams without sockets.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::buffer::{BufferPool, Checkout};

/// Side-effect listener on the bytes a pump forwards
///
/// `observe` sees every chunk before it is written to the peer. It cannot
/// change or hold back the bytes.
pub trait StreamObserver: Send {
    fn observe(&mut self, data: &[u8]);

    /// The source endpoint reached end of stream
    fn on_eof(&mut self) {}

    /// The tunnel is closing this leg; `cause` is set when it failed
    fn on_close(&mut self, _cause: Option<&io::Error>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("client->server"),
            Direction::ServerToClient => f.write_str("server->client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Ready to start the next read
    Idle,
    /// A read returned no data; the reader's waker is registered
    AwaitReadable,
    /// Bytes read and observed, being written to the peer
    AwaitWriteComplete,
    /// Source hit EOF; shutting down the peer's write side
    ShuttingDown,
    Closed,
}

/// How a failed leg is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    TimedOut,
    /// The other end was already gone (reset, broken pipe, not connected)
    AlreadyClosed,
    Io,
}

impl FailureKind {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => FailureKind::TimedOut,
            io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => FailureKind::AlreadyClosed,
            _ => FailureKind::Io,
        }
    }
}

/// Relay for one direction of a tunnel
pub struct Pump {
    direction: Direction,
    state: PumpState,
    pool: Arc<BufferPool>,
    buffer: Option<Checkout>,
    filled: usize,
    written: usize,
    transferred: u64,
    observer: Option<Box<dyn StreamObserver>>,
}

impl Pump {
    pub fn new(direction: Direction, pool: Arc<BufferPool>) -> Self {
        Self {
            direction,
            state: PumpState::Idle,
            pool,
            buffer: None,
            filled: 0,
            written: 0,
            transferred: 0,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn StreamObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == PumpState::Closed
    }

    /// Bytes written to the peer so far
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Advance until the pump is blocked on I/O or finished
    ///
    /// Returns `Ready(Ok(()))` once the source reached EOF and the peer's
    /// write side was shut down, and `Ready(Err(_))` on any read or write
    /// failure, after which the pump is closed.
    pub fn poll_advance<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut R,
        writer: &mut W,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            let step = match self.state {
                PumpState::Idle | PumpState::AwaitReadable => self.poll_read(cx, reader),
                PumpState::AwaitWriteComplete => self.poll_write(cx, writer),
                PumpState::ShuttingDown => {
                    if let Err(e) = ready!(Pin::new(&mut *writer).poll_shutdown(cx)) {
                        tracing::debug!(direction = %self.direction, error = %e, "Peer shutdown failed");
                    }
                    self.state = PumpState::Closed;
                    Poll::Ready(Ok(()))
                }
                PumpState::Closed => return Poll::Ready(Ok(())),
            };
            match step {
                Poll::Ready(Ok(())) => continue,
                Poll::Ready(Err(e)) => {
                    self.buffer = None;
                    self.state = PumpState::Closed;
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_read<R>(&mut self, cx: &mut Context<'_>, reader: &mut R) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let pool = &self.pool;
        let buffer = self.buffer.get_or_insert_with(|| pool.checkout());
        let mut read_buf = ReadBuf::new(&mut buffer[..]);

        match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
            Poll::Pending => {
                // Nothing to hold on to while waiting
                self.buffer = None;
                self.state = PumpState::AwaitReadable;
                Poll::Pending
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                if n == 0 {
                    self.buffer = None;
                    if let Some(observer) = self.observer.as_mut() {
                        observer.on_eof();
                    }
                    self.state = PumpState::ShuttingDown;
                } else {
                    if let Some(observer) = self.observer.as_mut() {
                        observer.observe(&buffer[..n]);
                    }
                    self.filled = n;
                    self.written = 0;
                    self.state = PumpState::AwaitWriteComplete;
                }
                Poll::Ready(Ok(()))
            }
        }
    }

    fn poll_write<W>(&mut self, cx: &mut Context<'_>, writer: &mut W) -> Poll<io::Result<()>>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let Some(buffer) = self.buffer.as_ref() else {
            self.state = PumpState::Idle;
            return Poll::Ready(Ok(()));
        };

        while self.written < self.filled {
            let n = ready!(
                Pin::new(&mut *writer).poll_write(cx, &buffer[self.written..self.filled])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
            self.transferred += n as u64;
        }
        ready!(Pin::new(&mut *writer).poll_flush(cx))?;

        self.buffer = None;
        self.state = PumpState::Idle;
        Poll::Ready(Ok(()))
    }

    /// Close this leg, releasing the buffer and telling the observer why
    pub fn close(&mut self, cause: Option<&io::Error>) {
        self.buffer = None;
        self.state = PumpState::Closed;
        if let Some(observer) = self.observer.as_mut() {
            observer.on_close(cause);
        }
    }
}

impl fmt::Debug for Pump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pump")
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("transferred", &self.transferred)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}
