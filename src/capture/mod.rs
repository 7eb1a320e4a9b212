//! Transaction capture: parsing tunnel traffic into HTTP exchanges and
//! handing completed ones to content observers

pub mod dispatcher;
mod headers;
mod log;
mod message;
pub mod observer;
pub mod parser;
pub mod snapshot;
pub mod store;

pub use dispatcher::{ContentObserver, Dispatch, ObserverError, SkipReason, TransactionDispatcher};
pub use headers::HeaderList;
pub use log::LoggingObserver;
pub use message::{BodyChunks, HttpRequest, HttpResponse, HttpTransaction};
pub use observer::ProtocolObserver;
pub use snapshot::{CapturedRequest, CapturedResponse};
pub use store::{CaptureSession, TransactionStore};
