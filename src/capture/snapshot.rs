//! Read-only views of a completed transaction handed to content observers

use std::collections::HashMap;
use std::io::Read;
use std::sync::OnceLock;

use bytes::buf::Reader;
use bytes::{Buf, Bytes};

use super::headers::HeaderList;
use super::message::{HttpRequest, HttpResponse};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Request metadata of a completed transaction
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    method: String,
    uri: String,
    version: String,
    path: String,
    query: Option<String>,
    headers: HeaderList,
    body: Bytes,
    parameters: OnceLock<HashMap<String, Vec<String>>>,
}

impl CapturedRequest {
    pub(crate) fn from_request(request: &HttpRequest) -> Self {
        let uri = request.uri().unwrap_or_default().to_string();
        let (path, query) = split_target(&uri);
        Self {
            method: request.method().unwrap_or_default().to_string(),
            version: request.version().unwrap_or_default().to_string(),
            path,
            query,
            uri,
            headers: request.headers().clone(),
            body: request.body().to_bytes(),
            parameters: OnceLock::new(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request target exactly as sent
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Path component of the target, without the query string
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// A fresh reader over the raw body; each call starts from the beginning
    pub fn body_reader(&self) -> Reader<Bytes> {
        self.body.clone().reader()
    }

    /// Decoded query-string and form-body parameters, parsed on first use
    ///
    /// Values for a repeated name keep their order of appearance, query
    /// string first. A name without `=` maps to an empty value; a pair with
    /// an empty name is dropped.
    pub fn parameters(&self) -> &HashMap<String, Vec<String>> {
        self.parameters.get_or_init(|| {
            let mut params: HashMap<String, Vec<String>> = HashMap::new();
            let mut collect = |input: &[u8]| {
                for (name, value) in url::form_urlencoded::parse(input) {
                    if name.is_empty() {
                        continue;
                    }
                    params
                        .entry(name.into_owned())
                        .or_default()
                        .push(value.into_owned());
                }
            };
            if let Some(query) = &self.query {
                collect(query.as_bytes());
            }
            if self.is_form_body() {
                collect(&self.body);
            }
            params
        })
    }

    /// All values of one parameter
    pub fn parameter(&self, name: &str) -> Option<&[String]> {
        self.parameters().get(name).map(Vec::as_slice)
    }

    fn is_form_body(&self) -> bool {
        self.content_type()
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|mime| {
                mime.trim()
                    .eq_ignore_ascii_case("application/x-www-form-urlencoded")
            })
    }
}

/// Response metadata of a completed transaction
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    status: u16,
    reason: String,
    version: String,
    headers: HeaderList,
    raw_body: Bytes,
    decoded: OnceLock<Bytes>,
}

impl CapturedResponse {
    pub(crate) fn from_response(response: &HttpResponse) -> Self {
        Self {
            status: response.status().unwrap_or_default(),
            reason: response.reason().unwrap_or_default().to_string(),
            version: response.version().unwrap_or_default().to_string(),
            headers: response.headers().clone(),
            raw_body: response.body().to_bytes(),
            decoded: OnceLock::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Body bytes as they crossed the wire
    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    /// Body with `Content-Encoding` removed, decoded on first use
    ///
    /// Unknown encodings are returned raw. Gzip data is recognised by its
    /// magic bytes when the header is missing or names something else. A
    /// body that fails to decode is returned raw.
    pub fn body(&self) -> &Bytes {
        self.decoded.get_or_init(|| {
            decode_body(self.headers.get("content-encoding"), &self.raw_body)
        })
    }

    pub fn body_reader(&self) -> Reader<Bytes> {
        self.body().clone().reader()
    }
}

/// Split a request target into path and query
///
/// Absolute-form targets (`http://host/path?q`) are reduced to their path.
fn split_target(target: &str) -> (String, Option<String>) {
    if target.starts_with("http://") || target.starts_with("https://") {
        if let Ok(url) = url::Url::parse(target) {
            return (url.path().to_string(), url.query().map(str::to_string));
        }
    }
    let target = target.split('#').next().unwrap_or_default();
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    }
}

fn decode_body(encoding: Option<&str>, raw: &Bytes) -> Bytes {
    if raw.is_empty() {
        return raw.clone();
    }

    if let Some(encoding) = encoding {
        let mut data = raw.clone();
        let mut decoded_all = true;
        // Codings are listed in the order applied, so undo them in reverse
        for coding in encoding.rsplit(',').map(str::trim) {
            match decode_one(coding, &data) {
                Some(Ok(out)) => data = out,
                Some(Err(e)) => {
                    tracing::debug!(coding = %coding, error = %e, "Failed to decode response body");
                    decoded_all = false;
                    break;
                }
                None => {
                    decoded_all = false;
                    break;
                }
            }
        }
        if decoded_all {
            return data;
        }
    }

    if raw.starts_with(&GZIP_MAGIC) {
        if let Ok(out) = read_all(flate2::read::GzDecoder::new(&raw[..])) {
            return out;
        }
    }
    raw.clone()
}

/// `None` for codings this module does not know
fn decode_one(coding: &str, data: &[u8]) -> Option<std::io::Result<Bytes>> {
    let coding = coding.to_ascii_lowercase();
    let result = match coding.as_str() {
        "identity" | "" => Ok(Bytes::copy_from_slice(data)),
        "gzip" | "x-gzip" => read_all(flate2::read::GzDecoder::new(data)),
        "br" => read_all(brotli::Decompressor::new(data, 4096)),
        "deflate" => read_all(flate2::read::ZlibDecoder::new(data))
            .or_else(|_| read_all(flate2::read::DeflateDecoder::new(data))),
        _ => return None,
    };
    Some(result)
}

fn read_all(mut reader: impl Read) -> std::io::Result<Bytes> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::store::TransactionStore;
    use crate::test_report;
    use std::io::Write;

    fn request(uri: &str, content_type: Option<&str>, body: &'static [u8]) -> CapturedRequest {
        let mut store = TransactionStore::new();
        store.begin_request("POST", uri, "HTTP/1.1");
        if let Some(ct) = content_type {
            store.add_request_header("Content-Type", ct);
        }
        store.append_request_body(Bytes::from_static(body));
        CapturedRequest::from_request(store.current().request())
    }

    fn response(encoding: Option<&str>, body: Vec<u8>) -> CapturedResponse {
        let mut store = TransactionStore::new();
        store.begin_response("HTTP/1.1", 200, "OK");
        if let Some(enc) = encoding {
            store.add_response_header("Content-Encoding", enc);
        }
        store.append_response_body(Bytes::from(body));
        CapturedResponse::from_response(store.current().response())
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_repeated_query_parameter() {
        let t = test_report!("Repeated query parameters keep every value in order");
        let req = request("/x?a=1&a=2", None, b"");
        t.assert_eq("path", &req.path(), &"/x");
        t.assert_eq("query", &req.query_string(), &Some("a=1&a=2"));
        t.assert_eq(
            "a",
            &req.parameter("a"),
            &Some(&["1".to_string(), "2".to_string()][..]),
        );
    }

    #[test]
    fn test_form_body_parameters() {
        let t = test_report!("Form body parameters are decoded and merged with the query");
        let req = request(
            "/submit?page=2",
            Some("application/x-www-form-urlencoded; charset=UTF-8"),
            b"name=J%C3%BCrgen&flag&=orphan&page=3",
        );
        let params = req.parameters();
        t.assert_eq("decoded utf-8", &params.get("name"), &Some(&vec!["Jürgen".to_string()]));
        t.assert_eq("bare key", &params.get("flag"), &Some(&vec![String::new()]));
        t.assert_true("empty key dropped", !params.contains_key(""));
        t.assert_eq(
            "query then body",
            &params.get("page"),
            &Some(&vec!["2".to_string(), "3".to_string()]),
        );
    }

    #[test]
    fn test_non_form_body_not_parsed() {
        let t = test_report!("JSON bodies do not contribute parameters");
        let req = request("/api", Some("application/json"), b"a=1");
        t.assert_true("no params", req.parameters().is_empty());
    }

    #[test]
    fn test_absolute_form_target() {
        let t = test_report!("Absolute-form request targets are reduced to the path");
        let req = request("http://a.example/p/q?k=v", None, b"");
        t.assert_eq("path", &req.path(), &"/p/q");
        t.assert_eq("query", &req.query_string(), &Some("k=v"));
    }

    #[test]
    fn test_body_reader_rereadable() {
        let t = test_report!("Request body reader can be created repeatedly");
        let req = request("/", None, b"payload");
        for _ in 0..2 {
            let mut out = String::new();
            req.body_reader().read_to_string(&mut out).unwrap();
            t.assert_eq("body", &out.as_str(), &"payload");
        }
    }

    #[test]
    fn test_gzip_decoded() {
        let t = test_report!("Gzip response body is decompressed");
        let resp = response(Some("gzip"), gzip(b"hello"));
        t.assert_eq("body", resp.body(), &Bytes::from_static(b"hello"));
        t.assert_true("raw kept", resp.raw_body().starts_with(&GZIP_MAGIC));
    }

    #[test]
    fn test_brotli_decoded() {
        let t = test_report!("Brotli response body is decompressed");
        let mut compressed = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
            writer.write_all(b"hello brotli").unwrap();
        }
        let resp = response(Some("br"), compressed);
        t.assert_eq("body", resp.body(), &Bytes::from_static(b"hello brotli"));
    }

    #[test]
    fn test_gzip_sniffed_when_mislabelled() {
        let t = test_report!("Gzip magic bytes are sniffed when the header is missing or wrong");
        let missing = response(None, gzip(b"sniffed"));
        t.assert_eq("missing header", missing.body(), &Bytes::from_static(b"sniffed"));

        let wrong = response(Some("deflate"), gzip(b"sniffed"));
        t.assert_eq("wrong header", wrong.body(), &Bytes::from_static(b"sniffed"));
    }

    #[test]
    fn test_unknown_encoding_passes_through() {
        let t = test_report!("Unknown or broken encodings return the raw body");
        let unknown = response(Some("zstd"), b"opaque".to_vec());
        t.assert_eq("unknown", unknown.body(), &Bytes::from_static(b"opaque"));

        let broken = response(Some("gzip"), b"not gzip".to_vec());
        t.assert_eq("broken", broken.body(), &Bytes::from_static(b"not gzip"));
    }
}
