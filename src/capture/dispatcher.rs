//! Fan-out of completed transactions to content observers

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::snapshot::{CapturedRequest, CapturedResponse};
use super::store::TransactionStore;

/// Error returned by a content observer's `accept`
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of completed HTTP transactions
///
/// `interested` runs on the tunnel task and should be cheap. `accept` runs on
/// the blocking pool with its own copy of the snapshots, so observers never
/// share mutable state with each other or with the relay.
pub trait ContentObserver: Send + Sync + 'static {
    /// Name used in log output
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn interested(&self, request: &CapturedRequest) -> bool;

    fn accept(
        &self,
        request: &CapturedRequest,
        response: &CapturedResponse,
    ) -> Result<(), ObserverError>;
}

/// Why a finished transaction was not handed to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The client leg closed with an error while the request was in flight
    AbnormalDisconnect,
    /// Neither a request method nor a response status was captured
    NothingCaptured,
    /// Received body size differs from the declared `Content-Length`
    LengthMismatch { declared: u64, received: u64 },
    NoObservers,
}

/// Outcome of [`TransactionDispatcher::finalize`]
#[derive(Debug)]
pub enum Dispatch {
    Skipped(SkipReason),
    /// One handle per interested observer, in registration order
    Submitted(Vec<JoinHandle<()>>),
}

impl Dispatch {
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Dispatch::Skipped(reason) => Some(*reason),
            Dispatch::Submitted(_) => None,
        }
    }

    /// Wait for every submitted `accept` call to finish
    pub async fn join(self) {
        if let Dispatch::Submitted(handles) = self {
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

/// Validates completed transactions and delivers them to observers
///
/// The observer list is fixed at construction and shared by every tunnel.
#[derive(Clone)]
pub struct TransactionDispatcher {
    observers: Arc<[Arc<dyn ContentObserver>]>,
}

impl TransactionDispatcher {
    pub fn new(observers: Vec<Arc<dyn ContentObserver>>) -> Self {
        Self {
            observers: observers.into(),
        }
    }

    /// Finish the current transaction of `store`
    ///
    /// Called when a response completes, or when the server leg closes
    /// cleanly with a request still in flight. On a skip the store is left as
    /// it is; on submission the transaction is rotated into the completed
    /// list first.
    pub fn finalize(
        &self,
        store: &mut TransactionStore,
        abnormal_disconnect: bool,
        authority: &str,
    ) -> Dispatch {
        if abnormal_disconnect {
            tracing::debug!(host = %authority, "Client disconnected abnormally, transaction not dispatched");
            return Dispatch::Skipped(SkipReason::AbnormalDisconnect);
        }

        let current = store.current();
        let request = current.request();
        let response = current.response();
        if request.method().is_none() && response.status().is_none() {
            return Dispatch::Skipped(SkipReason::NothingCaptured);
        }

        if let Some(declared) = response.content_length() {
            let received = response.received_len();
            if declared > 0 && response.body_expected() && received != declared {
                tracing::warn!(
                    host = %authority,
                    uri = request.uri().unwrap_or("-"),
                    declared,
                    received,
                    "Content-Length mismatch, transaction not dispatched"
                );
                return Dispatch::Skipped(SkipReason::LengthMismatch { declared, received });
            }
        }

        if self.observers.is_empty() {
            return Dispatch::Skipped(SkipReason::NoObservers);
        }

        let done = store.mark_complete();
        let request = CapturedRequest::from_request(done.request());
        let response = CapturedResponse::from_response(done.response());

        let mut handles = Vec::new();
        for observer in self.observers.iter() {
            let interested = catch_unwind(AssertUnwindSafe(|| observer.interested(&request)));
            match interested {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => {
                    tracing::error!(observer = observer.name(), "Observer panicked in interested()");
                    continue;
                }
            }

            let observer = Arc::clone(observer);
            let request = request.clone();
            let response = response.clone();
            let authority = authority.to_string();
            let task = move || deliver(observer.as_ref(), &request, &response, &authority);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => handles.push(runtime.spawn_blocking(task)),
                Err(_) => task(),
            }
        }
        Dispatch::Submitted(handles)
    }
}

impl std::fmt::Debug for TransactionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.observers.iter().map(|o| o.name()).collect();
        f.debug_struct("TransactionDispatcher")
            .field("observers", &names)
            .finish()
    }
}

fn deliver(
    observer: &dyn ContentObserver,
    request: &CapturedRequest,
    response: &CapturedResponse,
    authority: &str,
) {
    match catch_unwind(AssertUnwindSafe(|| observer.accept(request, response))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(
            observer = observer.name(),
            host = %authority,
            uri = %request.uri(),
            error = %e,
            "Observer failed to accept transaction"
        ),
        Err(_) => tracing::error!(
            observer = observer.name(),
            host = %authority,
            uri = %request.uri(),
            "Observer panicked in accept()"
        ),
    }
}
