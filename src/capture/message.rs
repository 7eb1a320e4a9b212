//! Captured request/response state for one transaction

use bytes::{Bytes, BytesMut};

use super::headers::HeaderList;

/// Body bytes as received, kept as the chunks they arrived in
///
/// Appending never copies earlier chunks; `len` is maintained alongside so
/// it always equals the sum of the chunk lengths.
#[derive(Debug, Clone, Default)]
pub struct BodyChunks {
    chunks: Vec<Bytes>,
    len: usize,
}

impl BodyChunks {
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push(chunk);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Join the chunks into one contiguous buffer
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut joined = BytesMut::with_capacity(self.len);
                for chunk in many {
                    joined.extend_from_slice(chunk);
                }
                joined.freeze()
            }
        }
    }
}

/// Request side of a transaction
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub(crate) method: Option<String>,
    pub(crate) uri: Option<String>,
    pub(crate) version: Option<String>,
    pub(crate) headers: HeaderList,
    pub(crate) body: BodyChunks,
}

impl HttpRequest {
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn body(&self) -> &BodyChunks {
        &self.body
    }
}

/// Response side of a transaction
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub(crate) version: Option<String>,
    pub(crate) status: Option<u16>,
    pub(crate) reason: Option<String>,
    pub(crate) headers: HeaderList,
    pub(crate) body: BodyChunks,
    /// Parsed `Content-Length`, independent of what actually arrived
    pub(crate) content_length: Option<u64>,
    /// False when framing rules say this response carries no body
    pub(crate) body_expected: bool,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            version: None,
            status: None,
            reason: None,
            headers: HeaderList::default(),
            body: BodyChunks::default(),
            content_length: None,
            body_expected: true,
        }
    }
}

impl HttpResponse {
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn body(&self) -> &BodyChunks {
        &self.body
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Bytes of body received on the wire (still content-encoded)
    pub fn received_len(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn body_expected(&self) -> bool {
        self.body_expected
    }
}

/// One request paired with its response
#[derive(Debug, Clone, Default)]
pub struct HttpTransaction {
    pub(crate) request: HttpRequest,
    pub(crate) response: HttpResponse,
}

impl HttpTransaction {
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// Nothing has been captured into this transaction yet
    pub fn is_empty(&self) -> bool {
        self.request.method.is_none()
            && self.request.uri.is_none()
            && self.request.headers.is_empty()
            && self.request.body.is_empty()
            && self.response.status.is_none()
            && self.response.headers.is_empty()
            && self.response.body.is_empty()
    }
}
