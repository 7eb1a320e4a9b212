//! Per-tunnel transaction store

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use super::dispatcher::TransactionDispatcher;
use super::message::{HttpRequest, HttpResponse, HttpTransaction};

/// Completed transactions kept for inspection before the oldest is dropped
const COMPLETED_RETAINED: usize = 32;

/// The transaction being captured plus the ones already completed
///
/// Request fields are written by the client-facing parser, response fields by
/// the server-facing one. Completing a transaction moves it to the completed
/// list and leaves an empty transaction in its place, so a keep-alive tunnel
/// captures each exchange independently.
#[derive(Debug, Default)]
pub struct TransactionStore {
    current: HttpTransaction,
    completed: VecDeque<HttpTransaction>,
    completed_total: u64,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &HttpTransaction {
        &self.current
    }

    /// Completed transactions, oldest first
    pub fn completed(&self) -> impl Iterator<Item = &HttpTransaction> {
        self.completed.iter()
    }

    /// Number of transactions completed over the store's lifetime
    pub fn completed_total(&self) -> u64 {
        self.completed_total
    }

    pub fn begin_request(&mut self, method: &str, uri: &str, version: &str) {
        self.current.request = HttpRequest {
            method: Some(method.to_string()),
            uri: Some(uri.to_string()),
            version: Some(version.to_string()),
            ..HttpRequest::default()
        };
    }

    pub fn add_request_header(&mut self, name: &str, value: &str) {
        self.current.request.headers.set(name, value);
    }

    pub fn append_request_body(&mut self, chunk: Bytes) {
        self.current.request.body.push(chunk);
    }

    pub fn begin_response(&mut self, version: &str, status: u16, reason: &str) {
        self.current.response = HttpResponse {
            version: Some(version.to_string()),
            status: Some(status),
            reason: Some(reason.to_string()),
            ..HttpResponse::default()
        };
    }

    pub fn add_response_header(&mut self, name: &str, value: &str) {
        self.current.response.headers.set(name, value);
    }

    pub fn set_response_framing(&mut self, content_length: Option<u64>, body_expected: bool) {
        self.current.response.content_length = content_length;
        self.current.response.body_expected = body_expected;
    }

    pub fn append_response_body(&mut self, chunk: Bytes) {
        self.current.response.body.push(chunk);
    }

    /// A request line has been seen for the current transaction
    pub fn request_uri_known(&self) -> bool {
        self.current.request.uri.is_some()
    }

    pub fn current_method_is(&self, method: &str) -> bool {
        self.current
            .request
            .method
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(method))
    }

    /// Rotate the current transaction into the completed list
    pub fn mark_complete(&mut self) -> &HttpTransaction {
        let done = std::mem::take(&mut self.current);
        if self.completed.len() == COMPLETED_RETAINED {
            self.completed.pop_front();
        }
        self.completed.push_back(done);
        self.completed_total += 1;
        // The deque was just pushed to, so back() is always present
        &self.completed[self.completed.len() - 1]
    }

    pub fn clear_completed(&mut self) {
        self.completed.clear();
    }
}

/// Capture state shared by the two legs of one tunnel
///
/// The store sits behind a mutex because each leg writes its own half of the
/// transaction; the abnormal-disconnect flag is written by the client leg's
/// close handler and read when the server leg finalizes, so it is atomic.
pub struct CaptureSession {
    authority: String,
    store: Mutex<TransactionStore>,
    abnormal_disconnect: AtomicBool,
    dispatcher: Arc<TransactionDispatcher>,
}

impl CaptureSession {
    pub fn new(authority: impl Into<String>, dispatcher: Arc<TransactionDispatcher>) -> Self {
        Self {
            authority: authority.into(),
            store: Mutex::new(TransactionStore::new()),
            abnormal_disconnect: AtomicBool::new(false),
            dispatcher,
        }
    }

    /// CONNECT authority this session captures for
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Lock the store; a poisoned lock still yields the data
    pub fn store(&self) -> MutexGuard<'_, TransactionStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn dispatcher(&self) -> &TransactionDispatcher {
        &self.dispatcher
    }

    pub fn mark_abnormal_disconnect(&self) {
        self.abnormal_disconnect.store(true, Ordering::SeqCst);
    }

    pub fn abnormal_disconnect(&self) -> bool {
        self.abnormal_disconnect.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("authority", &self.authority)
            .field("abnormal_disconnect", &self.abnormal_disconnect())
            .finish_non_exhaustive()
    }
}
