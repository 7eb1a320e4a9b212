//! Protocol observers: HTTP parsers riding on the tunnel's read path

use std::io;
use std::sync::Arc;

use bytes::Bytes;

use super::parser::{MessageParser, ParseSink, Role};
use super::store::{CaptureSession, TransactionStore};
use crate::proxy::pump::StreamObserver;

/// Parses one direction of a tunnel into the shared capture session
///
/// The request observer sits on the client-facing leg and the response
/// observer on the server-facing leg. Both see exactly the bytes the pump
/// forwards; nothing they do can hold up or alter the relay.
pub struct ProtocolObserver {
    parser: MessageParser,
    session: Arc<CaptureSession>,
}

impl ProtocolObserver {
    pub fn request(session: Arc<CaptureSession>) -> Self {
        Self {
            parser: MessageParser::new(Role::Request),
            session,
        }
    }

    pub fn response(session: Arc<CaptureSession>) -> Self {
        Self {
            parser: MessageParser::new(Role::Response),
            session,
        }
    }

    pub fn role(&self) -> Role {
        self.parser.role()
    }

    fn run<F>(&mut self, f: F)
    where
        F: FnOnce(&mut MessageParser, &mut StoreSink<'_>) -> Result<(), super::parser::ParseError>,
    {
        let session = Arc::clone(&self.session);
        let mut store = session.store();
        let mut sink = StoreSink {
            role: self.parser.role(),
            store: &mut *store,
            session: &session,
        };
        if let Err(e) = f(&mut self.parser, &mut sink) {
            tracing::debug!(
                host = %session.authority(),
                role = %self.parser.role(),
                error = %e,
                "HTTP parse failed, capture skipped for this stream"
            );
        }
    }
}

impl StreamObserver for ProtocolObserver {
    fn observe(&mut self, data: &[u8]) {
        self.run(|parser, sink| parser.feed(data, sink));
    }

    fn on_eof(&mut self) {
        self.run(|parser, sink| parser.finish(sink));
    }

    fn on_close(&mut self, cause: Option<&io::Error>) {
        let session = Arc::clone(&self.session);
        let mut store = session.store();
        if !store.request_uri_known() {
            return;
        }
        match (self.parser.role(), cause) {
            (Role::Request, Some(e)) => {
                tracing::debug!(
                    host = %session.authority(),
                    error = %e,
                    "Client leg closed with a request in flight"
                );
                session.mark_abnormal_disconnect();
            }
            (Role::Response, None) if !self.parser.is_complete() => {
                // The server closed without ending its message
                session.dispatcher().finalize(
                    &mut *store,
                    session.abnormal_disconnect(),
                    session.authority(),
                );
            }
            _ => {}
        }
    }
}

/// Writes parse events into the store for one direction
struct StoreSink<'a> {
    role: Role,
    store: &'a mut TransactionStore,
    session: &'a CaptureSession,
}

impl ParseSink for StoreSink<'_> {
    fn on_request_line(&mut self, method: &str, uri: &str, version: &str) {
        tracing::trace!(host = %self.session.authority(), method, uri, "Request line");
        self.store.begin_request(method, uri, version);
    }

    fn on_status_line(&mut self, version: &str, status: u16, reason: &str) {
        tracing::trace!(host = %self.session.authority(), status, "Status line");
        self.store.begin_response(version, status, reason);
    }

    fn on_header(&mut self, name: &str, value: &str) {
        match self.role {
            Role::Request => self.store.add_request_header(name, value),
            Role::Response => self.store.add_response_header(name, value),
        }
    }

    fn on_headers_complete(&mut self, content_length: Option<u64>, has_body: bool) {
        if self.role == Role::Response {
            self.store.set_response_framing(content_length, has_body);
        }
    }

    fn on_body(&mut self, chunk: &[u8]) {
        let chunk = Bytes::copy_from_slice(chunk);
        match self.role {
            Role::Request => self.store.append_request_body(chunk),
            Role::Response => self.store.append_response_body(chunk),
        }
    }

    fn on_message_complete(&mut self) {
        if self.role == Role::Response {
            self.session.dispatcher().finalize(
                self.store,
                self.session.abnormal_disconnect(),
                self.session.authority(),
            );
        }
    }

    fn answers_head_request(&self) -> bool {
        self.store.current_method_is("HEAD")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::dispatcher::{ContentObserver, ObserverError, TransactionDispatcher};
    use crate::capture::snapshot::{CapturedRequest, CapturedResponse};
    use crate::test_report;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(String, u16, Bytes)>>,
    }

    impl ContentObserver for Recording {
        fn interested(&self, _request: &CapturedRequest) -> bool {
            true
        }

        fn accept(
            &self,
            request: &CapturedRequest,
            response: &CapturedResponse,
        ) -> Result<(), ObserverError> {
            self.seen.lock().unwrap().push((
                request.uri().to_string(),
                response.status(),
                response.body().clone(),
            ));
            Ok(())
        }
    }

    fn session(recording: &Arc<Recording>) -> Arc<CaptureSession> {
        let dispatcher = TransactionDispatcher::new(vec![recording.clone()]);
        Arc::new(CaptureSession::new("a.example:443", Arc::new(dispatcher)))
    }

    /// Accept calls run on the blocking pool; wait for them to land
    async fn settle(recording: &Recording, expected: usize) {
        for _ in 0..100 {
            if recording.seen.lock().unwrap().len() >= expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_keep_alive_pairs() {
        let t = test_report!("Two exchanges on one tunnel are captured independently");
        let recording = Arc::new(Recording::default());
        let session = session(&recording);
        let mut requests = ProtocolObserver::request(session.clone());
        let mut responses = ProtocolObserver::response(session.clone());

        requests.observe(b"GET /one HTTP/1.1\r\nHost: a.example\r\n\r\n");
        responses.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none");
        requests.observe(b"GET /two HTTP/1.1\r\nHost: a.example\r\n\r\n");
        responses.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\ntwo");
        settle(&recording, 2).await;

        let mut seen = recording.seen.lock().unwrap().clone();
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        t.assert_eq(
            "seen",
            &seen,
            &vec![
                ("/one".to_string(), 200u16, Bytes::from_static(b"one")),
                ("/two".to_string(), 200u16, Bytes::from_static(b"two")),
            ],
        );
        t.assert_true("current empty", session.store().current().is_empty());
        t.assert_eq("completed", &session.store().completed_total(), &2u64);
    }

    #[tokio::test]
    async fn test_chunked_with_stray_content_length_dispatched() {
        let t = test_report!("Chunked response with a stray Content-Length is still dispatched");
        let recording = Arc::new(Recording::default());
        let session = session(&recording);
        let mut requests = ProtocolObserver::request(session.clone());
        let mut responses = ProtocolObserver::response(session.clone());

        requests.observe(b"GET /mixed HTTP/1.1\r\n\r\n");
        responses.observe(
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n\
6\r\nchunky\r\n0\r\n\r\n",
        );
        settle(&recording, 1).await;

        t.assert_eq(
            "seen",
            &recording.seen.lock().unwrap().clone(),
            &vec![("/mixed".to_string(), 200u16, Bytes::from_static(b"chunky"))],
        );
    }

    #[tokio::test]
    async fn test_abnormal_client_close_suppresses() {
        let t = test_report!("Client error mid-response suppresses dispatch");
        let recording = Arc::new(Recording::default());
        let session = session(&recording);
        let mut requests = ProtocolObserver::request(session.clone());
        let mut responses = ProtocolObserver::response(session.clone());

        requests.observe(b"GET /x HTTP/1.1\r\n\r\n");
        responses.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel");
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        requests.on_close(Some(&reset));
        responses.observe(b"lo");
        responses.on_close(None);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        t.assert_true("abnormal flag", session.abnormal_disconnect());
        t.assert_true("nothing dispatched", recording.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_on_upstream_close() {
        let t = test_report!("Clean server close finalizes an unterminated response");
        let recording = Arc::new(Recording::default());
        let session = session(&recording);
        let mut requests = ProtocolObserver::request(session.clone());
        let mut responses = ProtocolObserver::response(session.clone());

        requests.observe(b"GET /stream HTTP/1.1\r\n\r\n");
        responses.observe(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\ndata\r\n");
        requests.on_close(None);
        responses.on_close(None);
        settle(&recording, 1).await;

        let seen = recording.seen.lock().unwrap().clone();
        t.assert_eq(
            "seen",
            &seen,
            &vec![("/stream".to_string(), 200u16, Bytes::from_static(b"data"))],
        );
    }

    #[tokio::test]
    async fn test_until_close_body_on_eof() {
        let t = test_report!("Read-until-close response completes at server EOF");
        let recording = Arc::new(Recording::default());
        let session = session(&recording);
        let mut requests = ProtocolObserver::request(session.clone());
        let mut responses = ProtocolObserver::response(session.clone());

        requests.observe(b"GET /old HTTP/1.0\r\n\r\n");
        responses.observe(b"HTTP/1.0 200 OK\r\n\r\nlegacy");
        responses.on_eof();
        responses.on_close(None);
        settle(&recording, 1).await;

        t.assert_eq("dispatched once", &recording.seen.lock().unwrap().len(), &1usize);
    }

    #[tokio::test]
    async fn test_garbage_does_not_dispatch() {
        let t = test_report!("Non-HTTP bytes are skipped without dispatching");
        let recording = Arc::new(Recording::default());
        let session = session(&recording);
        let mut requests = ProtocolObserver::request(session.clone());

        requests.observe(&[0x16, 0x03, 0x01, 0x00, 0x05, 0x01]);
        requests.on_close(None);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        t.assert_true("nothing dispatched", recording.seen.lock().unwrap().is_empty());
        t.assert_true("store untouched", session.store().current().is_empty());
    }
}
