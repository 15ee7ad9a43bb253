use bytes::Bytes;
use std::borrow::Cow;
use std::collections::HashMap;

/// Request methods understood by the wire parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GET,
    PUT,
    POST,
    HEAD,
    PATCH,
    DELETE,
    OPTIONS,
}

/// Protocol version of a parsed request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http10,
    Http11,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "HTTP/1.0",
            Protocol::Http11 => "HTTP/1.1",
        }
    }
}

/// A fully parsed HTTP request as handed to the user callback.
///
/// Header names are lowercased on insertion, so lookups use lowercase keys.
/// `path` is the percent-decoded request target.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub protocol: Protocol,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

impl Request {
    /// Looks up a header by its lowercase name.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }
}

/// Percent-decodes a request target.
///
/// A target with no `%` comes back borrowed. Escape sequences that are not
/// two hex digits stay in the output as they were sent.
pub(crate) fn percent_decode(target: &str) -> Cow<'_, str> {
    let bytes = target.as_bytes();
    let Some(first) = bytes.iter().position(|&b| b == b'%') else {
        return Cow::Borrowed(target);
    };

    let mut out = Vec::with_capacity(bytes.len());
    out.extend_from_slice(&bytes[..first]);

    let mut rest = &bytes[first..];
    while let Some(&byte) = rest.first() {
        if byte == b'%' {
            if let [_, hi, lo, ..] = rest {
                if let Some(decoded) = hex_pair(*hi, *lo) {
                    out.push(decoded);
                    rest = &rest[3..];
                    continue;
                }
            }
        }
        out.push(byte);
        rest = &rest[1..];
    }

    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let hi = (hi as char).to_digit(16)?;
    let lo = (lo as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}
