//! CONNECT proxy: connection handling, tunnels and the byte relay

pub mod buffer;
mod connect;
mod context;
mod handler;
pub mod pump;
mod response;
mod server;
mod tunnel;

pub use buffer::BufferPool;
pub use connect::{
    connect_upstream, Admission, ConnectDispatcher, ConnectHandler, ConnectOutcome,
    TransparentConnectHandler, TunnelSettings,
};
pub use context::ConnectContext;
pub use handler::ProxyHandler;
pub use pump::{Direction, FailureKind, Pump, PumpState, StreamObserver};
pub use response::ProxyBody;
pub use server::ProxyServer;
pub use tunnel::{Tunnel, TunnelStats};
