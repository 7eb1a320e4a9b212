//! Streaming HTTP/1.x message parser
//!
//! The parser never owns the stream: it is handed every slice the relay
//! forwards, reports what it recognises to a [`ParseSink`], and keeps just
//! enough state to resume on the next slice. Message heads are parsed with
//! `httparse`; body framing (`Content-Length`, `chunked`, read-until-close)
//! is tracked here.

use std::fmt;

/// Largest message head accepted before the message is treated as malformed
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Largest chunk-size or trailer line accepted
const MAX_LINE_LEN: usize = 4 * 1024;

const MAX_HEADERS: usize = 128;

/// Which side of the exchange a parser reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Request,
    Response,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Request => f.write_str("request"),
            Role::Response => f.write_str("response"),
        }
    }
}

/// Receives parse events in stream order
pub trait ParseSink {
    fn on_request_line(&mut self, _method: &str, _uri: &str, _version: &str) {}

    fn on_status_line(&mut self, _version: &str, _status: u16, _reason: &str) {}

    fn on_header(&mut self, name: &str, value: &str);

    /// Called once per message after the last header
    fn on_headers_complete(&mut self, _content_length: Option<u64>, _has_body: bool) {}

    fn on_body(&mut self, chunk: &[u8]);

    fn on_message_complete(&mut self);

    /// Whether the response being parsed answers a HEAD request
    fn answers_head_request(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed message head: {0}")]
    Head(#[from] httparse::Error),

    #[error("message head exceeds {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,

    #[error("invalid Content-Length {0:?}")]
    ContentLength(String),

    #[error("invalid chunk size line")]
    ChunkSize,

    #[error("missing CRLF after chunk data")]
    ChunkDelimiter,

    #[error("connection closed before the message completed")]
    EarlyEof,
}

#[derive(Debug)]
enum State {
    /// Collecting the start line and headers
    Head,
    Body(Framing),
    Complete,
    /// The stream left HTTP/1.x (101 Switching Protocols)
    Upgraded,
    /// A parse error occurred; the rest of the stream is not observed
    Failed,
}

#[derive(Debug)]
enum Framing {
    Length(u64),
    Chunked(Chunk),
    UntilClose,
}

#[derive(Debug)]
enum Chunk {
    SizeLine,
    Data(u64),
    DataEnd,
    Trailers,
}

/// Message head extracted from the buffered bytes
struct Head {
    len: usize,
    start: StartLine,
    headers: Vec<(String, String)>,
}

enum StartLine {
    Request {
        method: String,
        uri: String,
        version: String,
    },
    Status {
        version: String,
        code: u16,
        reason: String,
    },
}

/// Incremental parser for one direction of an HTTP/1.x stream
#[derive(Debug)]
pub struct MessageParser {
    role: Role,
    state: State,
    head: Vec<u8>,
    line: Vec<u8>,
}

impl MessageParser {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: State::Head,
            head: Vec::new(),
            line: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Return to the start-of-message state
    pub fn reset(&mut self) {
        self.state = State::Head;
        self.head.clear();
        self.line.clear();
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed)
    }

    /// Between messages with nothing buffered
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Head) && self.head.is_empty()
    }

    /// Feed the next slice of the stream
    ///
    /// A parser that completed a message is reset before it parses more
    /// bytes, so several messages may follow each other on one stream (and
    /// within one slice). After an error the parser stays failed and ignores
    /// further input.
    pub fn feed<S: ParseSink + ?Sized>(
        &mut self,
        data: &[u8],
        sink: &mut S,
    ) -> Result<(), ParseError> {
        let result = self.feed_inner(data, sink);
        if result.is_err() {
            self.state = State::Failed;
            self.head.clear();
            self.line.clear();
        }
        result
    }

    /// Signal that the stream ended
    ///
    /// Completes a read-until-close body. Ending anywhere else inside a
    /// message is an early EOF.
    pub fn finish<S: ParseSink + ?Sized>(&mut self, sink: &mut S) -> Result<(), ParseError> {
        match self.state {
            State::Body(Framing::UntilClose) => {
                self.state = State::Complete;
                sink.on_message_complete();
                Ok(())
            }
            State::Head if self.head.iter().all(u8::is_ascii_whitespace) => Ok(()),
            State::Complete | State::Upgraded | State::Failed => Ok(()),
            State::Head | State::Body(_) => {
                self.state = State::Failed;
                Err(ParseError::EarlyEof)
            }
        }
    }

    fn feed_inner<S: ParseSink + ?Sized>(
        &mut self,
        mut data: &[u8],
        sink: &mut S,
    ) -> Result<(), ParseError> {
        while !data.is_empty() {
            let consumed = match self.state {
                State::Complete => {
                    self.reset();
                    0
                }
                State::Upgraded | State::Failed => return Ok(()),
                State::Head => self.parse_head(data, sink)?,
                State::Body(_) => self.parse_body(data, sink)?,
            };
            data = &data[consumed..];
        }
        Ok(())
    }

    fn parse_head<S: ParseSink + ?Sized>(
        &mut self,
        data: &[u8],
        sink: &mut S,
    ) -> Result<usize, ParseError> {
        let buffered = self.head.len();
        self.head.extend_from_slice(data);

        let head = match self.role {
            Role::Request => parse_request_head(&self.head)?,
            Role::Response => parse_response_head(&self.head)?,
        };
        let Some(head) = head else {
            if self.head.len() > MAX_HEAD_LEN {
                return Err(ParseError::HeadTooLarge);
            }
            return Ok(data.len());
        };
        let consumed = head.len.saturating_sub(buffered);
        self.head.clear();

        // Interim responses precede the real one and are not captured
        if let StartLine::Status { code, .. } = head.start {
            if (100..200).contains(&code) && code != 101 {
                return Ok(consumed);
            }
        }

        let framing = self.framing(&head, sink)?;

        match &head.start {
            StartLine::Request {
                method,
                uri,
                version,
            } => sink.on_request_line(method, uri, version),
            StartLine::Status {
                version,
                code,
                reason,
            } => sink.on_status_line(version, *code, reason),
        }
        for (name, value) in &head.headers {
            sink.on_header(name, value);
        }
        // Chunked framing overrides any Content-Length the head also carries
        let content_length = match framing {
            Some(Framing::Chunked(_)) => None,
            _ => content_length(&head.headers)?,
        };
        sink.on_headers_complete(content_length, framing.is_some());

        match framing {
            Some(Framing::Length(0)) | None => {
                sink.on_message_complete();
                self.state = match head.start {
                    StartLine::Status { code: 101, .. } => State::Upgraded,
                    _ => State::Complete,
                };
            }
            Some(framing) => self.state = State::Body(framing),
        }
        Ok(consumed)
    }

    /// Body framing for a parsed head; `None` when the message has no body
    fn framing<S: ParseSink + ?Sized>(
        &self,
        head: &Head,
        sink: &S,
    ) -> Result<Option<Framing>, ParseError> {
        if let StartLine::Status { code, .. } = head.start {
            if code == 101 || code == 204 || code == 304 || sink.answers_head_request() {
                return Ok(None);
            }
        }

        if is_chunked(&head.headers) {
            return Ok(Some(Framing::Chunked(Chunk::SizeLine)));
        }
        match content_length(&head.headers)? {
            Some(len) => Ok(Some(Framing::Length(len))),
            None if self.role == Role::Response => Ok(Some(Framing::UntilClose)),
            None => Ok(None),
        }
    }

    fn parse_body<S: ParseSink + ?Sized>(
        &mut self,
        data: &[u8],
        sink: &mut S,
    ) -> Result<usize, ParseError> {
        let State::Body(framing) = &mut self.state else {
            return Ok(0);
        };

        match framing {
            Framing::UntilClose => {
                sink.on_body(data);
                Ok(data.len())
            }
            Framing::Length(remaining) => {
                let take = bounded(*remaining, data.len());
                sink.on_body(&data[..take]);
                *remaining -= take as u64;
                if *remaining == 0 {
                    self.state = State::Complete;
                    sink.on_message_complete();
                }
                Ok(take)
            }
            Framing::Chunked(chunk) => match chunk {
                Chunk::Data(remaining) => {
                    let take = bounded(*remaining, data.len());
                    sink.on_body(&data[..take]);
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        *chunk = Chunk::DataEnd;
                    }
                    Ok(take)
                }
                Chunk::DataEnd => match data[0] {
                    b'\r' => Ok(1),
                    b'\n' => {
                        *chunk = Chunk::SizeLine;
                        Ok(1)
                    }
                    _ => Err(ParseError::ChunkDelimiter),
                },
                Chunk::SizeLine => {
                    let Some(consumed) = take_line(&mut self.line, data)? else {
                        return Ok(data.len());
                    };
                    let size = match httparse::parse_chunk_size(&self.line) {
                        Ok(httparse::Status::Complete((_, size))) => size,
                        _ => return Err(ParseError::ChunkSize),
                    };
                    self.line.clear();
                    *chunk = if size == 0 {
                        Chunk::Trailers
                    } else {
                        Chunk::Data(size)
                    };
                    Ok(consumed)
                }
                Chunk::Trailers => {
                    let Some(consumed) = take_line(&mut self.line, data)? else {
                        return Ok(data.len());
                    };
                    let blank = self.line == b"\r\n" || self.line == b"\n";
                    self.line.clear();
                    if blank {
                        self.state = State::Complete;
                        sink.on_message_complete();
                    }
                    Ok(consumed)
                }
            },
        }
    }
}

fn bounded(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |r| r.min(available))
}

/// Append bytes up to and including the next LF; `Some(consumed)` once the
/// line is whole
fn take_line(line: &mut Vec<u8>, data: &[u8]) -> Result<Option<usize>, ParseError> {
    let (chunk, complete) = match data.iter().position(|&b| b == b'\n') {
        Some(pos) => (&data[..=pos], true),
        None => (data, false),
    };
    line.extend_from_slice(chunk);
    if line.len() > MAX_LINE_LEN {
        return Err(ParseError::ChunkSize);
    }
    Ok(complete.then_some(chunk.len()))
}

fn version_string(minor: Option<u8>) -> String {
    format!("HTTP/1.{}", minor.unwrap_or(1))
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

fn parse_request_head(buf: &[u8]) -> Result<Option<Head>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(len) => Ok(Some(Head {
            len,
            start: StartLine::Request {
                method: req.method.unwrap_or_default().to_string(),
                uri: req.path.unwrap_or_default().to_string(),
                version: version_string(req.version),
            },
            headers: collect_headers(req.headers),
        })),
    }
}

fn parse_response_head(buf: &[u8]) -> Result<Option<Head>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(len) => Ok(Some(Head {
            len,
            start: StartLine::Status {
                version: version_string(resp.version),
                code: resp.code.unwrap_or_default(),
                reason: resp.reason.unwrap_or_default().to_string(),
            },
            headers: collect_headers(resp.headers),
        })),
    }
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("transfer-encoding"))
        .filter_map(|(_, value)| value.rsplit(',').next())
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// The declared `Content-Length`; conflicting or non-numeric values are errors
fn content_length(headers: &[(String, String)]) -> Result<Option<u64>, ParseError> {
    let mut declared = None;
    for (_, value) in headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("content-length"))
    {
        for part in value.split(',') {
            let len: u64 = part
                .trim()
                .parse()
                .map_err(|_| ParseError::ContentLength(value.clone()))?;
            match declared {
                Some(existing) if existing != len => {
                    return Err(ParseError::ContentLength(value.clone()))
                }
                _ => declared = Some(len),
            }
        }
    }
    Ok(declared)
}
