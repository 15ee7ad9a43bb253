use crate::http::request::{Method, Protocol};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;

/// Errors produced by the wire parser.
///
/// `TooSmall` is the resume signal: the visible bytes end before the current
/// element does, and the unread tail stays buffered for the next feed. Every
/// other variant is terminal for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Need more bytes; the unread tail is kept for the next feed
    TooSmall,
    /// Unknown or malformed method token
    InvalidMethod,
    /// Request target outside printable ASCII or malformed
    InvalidUri,
    /// Request target exceeds the URI limit
    UriTooLarge,
    /// Not HTTP/1.0 or HTTP/1.1, or missing CRLF after the version
    InvalidProtocol,
    /// Bad byte in a header name or value, or malformed line ending
    InvalidHeader,
    /// More header lines than the header-count limit
    TooManyHeaders,
    /// Header name over 64 bytes or value at 2048 bytes or more
    HeaderTooLarge,
    /// Content-Length is not a plain non-negative integer
    InvalidContentLength,
    /// Declared body length exceeds the body limit
    TooLarge,
    /// Transfer-Encoding: chunked is not supported
    NotImplemented,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooSmall => write!(f, "need more bytes"),
            Self::InvalidMethod => write!(f, "invalid HTTP method"),
            Self::InvalidUri => write!(f, "invalid request target"),
            Self::UriTooLarge => write!(f, "request target too large"),
            Self::InvalidProtocol => write!(f, "invalid protocol version"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::TooManyHeaders => write!(f, "too many headers"),
            Self::HeaderTooLarge => write!(f, "header too large"),
            Self::InvalidContentLength => write!(f, "invalid content-length"),
            Self::TooLarge => write!(f, "body too large"),
            Self::NotImplemented => write!(f, "transfer-encoding not implemented"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Per-request limits enforced by the parser stages.
#[derive(Debug, Clone)]
pub struct ParseLimits {
    /// Maximum request-target length in bytes.
    pub max_uri_size: usize,
    /// Maximum number of header lines.
    pub max_headers: usize,
    /// Maximum declared Content-Length.
    pub max_body_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_uri_size: 256,
            max_headers: 100,
            max_body_size: 4096,
        }
    }
}

const MAX_HEADER_NAME: usize = 64;
const MAX_HEADER_VALUE: usize = 2048;

/// Resumable HTTP/1.x request parser.
///
/// The parser accumulates bytes fed from the socket and exposes one method
/// per wire element: [`parse_method`](Self::parse_method),
/// [`parse_uri`](Self::parse_uri), [`parse_protocol`](Self::parse_protocol),
/// [`parse_headers`](Self::parse_headers) and
/// [`parse_body`](Self::parse_body). Each call either advances the read
/// cursor and fills in the matching field, or fails. A `TooSmall` failure
/// leaves the cursor at the start of the incomplete element so the same call
/// can be retried after the next [`feed`](Self::feed); partially consumed
/// header lines stay in the header map across retries.
///
/// The parser never looks at the socket. Arbitrary TCP segmentations are
/// handled by feeding whatever arrives and retrying the pending stage.
pub struct RequestParser {
    buf: BytesMut,
    pos: usize,
    limits: ParseLimits,
    method: Option<Method>,
    uri: Option<String>,
    protocol: Option<Protocol>,
    headers: Option<HashMap<String, String>>,
    headers_incomplete: bool,
    body: Option<Bytes>,
    body_done: bool,
}

impl RequestParser {
    pub fn new(limits: ParseLimits) -> Self {
        Self {
            buf: BytesMut::new(),
            pos: 0,
            limits,
            method: None,
            uri: None,
            protocol: None,
            headers: None,
            headers_incomplete: false,
            body: None,
            body_done: false,
        }
    }

    /// Appends freshly received bytes.
    ///
    /// The consumed prefix from previous stages is dropped first, so the
    /// buffer always starts at the unread tail of the stream.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pos > 0 {
            self.buf.advance(self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn headers(&self) -> Option<&HashMap<String, String>> {
        self.headers.as_ref()
    }

    pub fn headers_incomplete(&self) -> bool {
        self.headers_incomplete
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// True once `parse_body` has run to completion for this request.
    pub fn body_done(&self) -> bool {
        self.body_done
    }

    /// Recognizes the method token and the space that terminates it.
    pub fn parse_method(&mut self) -> Result<(), ParseError> {
        let b = &self.buf[self.pos..];
        if b.len() < 4 {
            return Err(ParseError::TooSmall);
        }

        let (method, advance) = match &b[..4] {
            b"GET " => (Method::GET, 4),
            b"PUT " => (Method::PUT, 4),
            b"POST" => {
                if b.len() < 5 {
                    return Err(ParseError::TooSmall);
                }
                if b[4] != b' ' {
                    return Err(ParseError::InvalidMethod);
                }
                (Method::POST, 5)
            }
            b"HEAD" => {
                if b.len() < 5 {
                    return Err(ParseError::TooSmall);
                }
                if b[4] != b' ' {
                    return Err(ParseError::InvalidMethod);
                }
                (Method::HEAD, 5)
            }
            b"PATC" => {
                if b.len() < 6 {
                    return Err(ParseError::TooSmall);
                }
                if &b[4..6] != b"H " {
                    return Err(ParseError::InvalidMethod);
                }
                (Method::PATCH, 6)
            }
            b"DELE" => {
                if b.len() < 7 {
                    return Err(ParseError::TooSmall);
                }
                if &b[3..7] != b"ETE " {
                    return Err(ParseError::InvalidMethod);
                }
                (Method::DELETE, 7)
            }
            b"OPTI" => {
                if b.len() < 8 {
                    return Err(ParseError::TooSmall);
                }
                if &b[4..8] != b"ONS " {
                    return Err(ParseError::InvalidMethod);
                }
                (Method::OPTIONS, 8)
            }
            _ => return Err(ParseError::InvalidMethod),
        };

        self.method = Some(method);
        self.pos += advance;
        Ok(())
    }

    /// Consumes the request target and its terminating space.
    ///
    /// Targets are either origin-form (`/...`) or the literal asterisk.
    /// Every byte must be printable ASCII and the whole target must fit the
    /// URI limit.
    pub fn parse_uri(&mut self) -> Result<(), ParseError> {
        let b = &self.buf[self.pos..];
        let first = *b.first().ok_or(ParseError::TooSmall)?;

        match first {
            b'/' => {
                let end = match b.iter().position(|&c| c == b' ') {
                    Some(end) => end,
                    // Terminator not visible yet
                    None => return Err(ParseError::TooSmall),
                };
                if end > self.limits.max_uri_size {
                    return Err(ParseError::UriTooLarge);
                }
                if b[..end].iter().any(|&c| !(0x20..=0x7e).contains(&c)) {
                    return Err(ParseError::InvalidUri);
                }
                // Printable ASCII, safe to take as str
                let uri = std::str::from_utf8(&b[..end])
                    .map_err(|_| ParseError::InvalidUri)?
                    .to_string();
                self.uri = Some(uri);
                self.pos += end + 1;
                Ok(())
            }
            b'*' => {
                if b.len() < 2 {
                    return Err(ParseError::TooSmall);
                }
                if b[1] != b' ' {
                    return Err(ParseError::InvalidUri);
                }
                self.uri = Some("*".to_string());
                self.pos += 2;
                Ok(())
            }
            _ => Err(ParseError::InvalidUri),
        }
    }

    /// Consumes `HTTP/1.0` or `HTTP/1.1` followed by CRLF.
    pub fn parse_protocol(&mut self) -> Result<(), ParseError> {
        let b = &self.buf[self.pos..];
        if b.len() < 10 {
            return Err(ParseError::TooSmall);
        }
        if &b[..4] != b"HTTP" {
            return Err(ParseError::InvalidProtocol);
        }
        let protocol = match &b[4..8] {
            b"/1.0" => Protocol::Http10,
            b"/1.1" => Protocol::Http11,
            _ => return Err(ParseError::InvalidProtocol),
        };
        if b[8] != b'\r' || b[9] != b'\n' {
            return Err(ParseError::InvalidProtocol);
        }

        self.protocol = Some(protocol);
        self.pos += 10;
        Ok(())
    }

    /// Consumes header lines until the blank line that ends the block.
    ///
    /// Names take `[A-Za-z0-9_-]` up to the colon and are lowercased at
    /// insertion; values take horizontal tab, space and printable ASCII and
    /// end at CRLF. Later values for a repeated name overwrite earlier ones.
    /// An incomplete trailing line keeps the cursor at its start; the lines
    /// consumed so far stay in the map for the retry.
    pub fn parse_headers(&mut self) -> Result<(), ParseError> {
        if self.headers.is_none() {
            self.headers = Some(HashMap::new());
            self.headers_incomplete = true;
        }

        loop {
            let b = &self.buf[self.pos..];

            if b.is_empty() {
                return Err(ParseError::TooSmall);
            }
            if b[0] == b'\r' {
                if b.len() < 2 {
                    return Err(ParseError::TooSmall);
                }
                if b[1] != b'\n' {
                    return Err(ParseError::InvalidHeader);
                }
                self.pos += 2;
                self.headers_incomplete = false;
                return Ok(());
            }

            // Header name
            let mut i = 0;
            let name_end = loop {
                if i >= b.len() {
                    return Err(ParseError::TooSmall);
                }
                let c = b[i];
                if c == b':' {
                    break i;
                }
                if !(c.is_ascii_alphanumeric() || c == b'-' || c == b'_') {
                    return Err(ParseError::InvalidHeader);
                }
                i += 1;
                if i > MAX_HEADER_NAME {
                    return Err(ParseError::HeaderTooLarge);
                }
            };
            if name_end == 0 {
                return Err(ParseError::InvalidHeader);
            }
            i += 1;

            // Skip leading spaces before the value
            while i < b.len() && b[i] == b' ' {
                i += 1;
            }
            let value_start = i;

            // Value runs over tab, space and printable ASCII; ends at CRLF
            loop {
                if i >= b.len() {
                    return Err(ParseError::TooSmall);
                }
                let c = b[i];
                if c == b'\t' || (0x20..=0x7e).contains(&c) {
                    i += 1;
                    if i - value_start >= MAX_HEADER_VALUE {
                        return Err(ParseError::HeaderTooLarge);
                    }
                    continue;
                }
                if c == b'\r' {
                    if i + 1 >= b.len() {
                        return Err(ParseError::TooSmall);
                    }
                    if b[i + 1] == b'\n' {
                        break;
                    }
                }
                return Err(ParseError::InvalidHeader);
            }

            let headers = self.headers.as_mut().expect("header map exists");
            if headers.len() >= self.limits.max_headers {
                return Err(ParseError::TooManyHeaders);
            }

            // Name and value are ASCII by construction
            let name = std::str::from_utf8(&b[..name_end])
                .map_err(|_| ParseError::InvalidHeader)?
                .to_ascii_lowercase();
            let value = std::str::from_utf8(&b[value_start..i])
                .map_err(|_| ParseError::InvalidHeader)?
                .to_string();
            headers.insert(name, value);

            self.pos += i + 2;
        }
    }

    /// Takes the request body when the headers call for one.
    ///
    /// A `content-length` header yields an owned slice of exactly that many
    /// bytes; `transfer-encoding: chunked` is rejected; otherwise the request
    /// has no body.
    pub fn parse_body(&mut self) -> Result<(), ParseError> {
        let Some(headers) = self.headers.as_ref() else {
            self.body_done = true;
            return Ok(());
        };

        if let Some(value) = headers.get("content-length") {
            let length = parse_content_length(value)?;
            if length > self.limits.max_body_size {
                return Err(ParseError::TooLarge);
            }
            let b = &self.buf[self.pos..];
            if b.len() < length {
                return Err(ParseError::TooSmall);
            }
            self.body = Some(Bytes::copy_from_slice(&b[..length]));
            self.pos += length;
        } else if headers
            .get("transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            return Err(ParseError::NotImplemented);
        }

        self.body_done = true;
        Ok(())
    }

    /// Whether the connection may serve another request after this one.
    ///
    /// True iff the headers were parsed, the protocol is HTTP/1.1 and no
    /// `Connection: close` was sent.
    pub fn can_keep_alive(&self) -> bool {
        let Some(headers) = self.headers.as_ref() else {
            return false;
        };
        if self.protocol != Some(Protocol::Http11) {
            return false;
        }
        headers
            .get("connection")
            .map(|v| !v.eq_ignore_ascii_case("close"))
            .unwrap_or(true)
    }

    /// Returns the parser to its pristine state for the next request.
    ///
    /// Every per-request field is cleared, including any unread buffered
    /// tail: request N+1 is only read from the socket after request N's
    /// response is enqueued.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
        self.method = None;
        self.uri = None;
        self.protocol = None;
        self.headers = None;
        self.headers_incomplete = false;
        self.body = None;
        self.body_done = false;
    }

    /// Moves the parsed header map out, leaving the parser awaiting `reset`.
    pub(crate) fn take_headers(&mut self) -> HashMap<String, String> {
        self.headers.take().unwrap_or_default()
    }

    pub(crate) fn take_body(&mut self) -> Option<Bytes> {
        self.body.take()
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new(ParseLimits::default())
    }
}

/// Plain non-negative integer: ASCII digits only, no sign, no whitespace.
fn parse_content_length(value: &str) -> Result<usize, ParseError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidContentLength);
    }
    value
        .parse::<usize>()
        .map_err(|_| ParseError::InvalidContentLength)
}
