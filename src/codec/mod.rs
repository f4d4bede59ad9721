//! Wire codec: converts between raw byte streams and structured HTTP/1.1
//! message parts. Decoding is incremental; a message split across any number
//! of reads is reassembled without ever assuming one read equals one message.

pub mod decode;

pub use decode::{RequestDecoder, ResponseDecoder};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};

use crate::error::ProtocolError;

/// Upper bound for a request or status line plus headers.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Header collection that keeps wire order. Lookups are case-insensitive
/// (names are normalized to lowercase on parse); re-emission walks entries
/// in the order they arrived, and `set` replaces in place so a rewritten
/// header keeps its position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Vec<(HeaderName, HeaderValue)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    /// Appends an entry; duplicate names are kept, in order.
    pub fn push(&mut self, name: HeaderName, value: HeaderValue) {
        self.0.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0
            .iter()
            .find(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// First value as a string, if present and valid ASCII.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    /// Replaces the first entry with this name, keeping its position;
    /// appends when absent.
    pub fn set(&mut self, name: HeaderName, value: HeaderValue) {
        match self
            .0
            .iter_mut()
            .find(|(n, _)| n.as_str().eq_ignore_ascii_case(name.as_str()))
        {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.0.iter().map(|(n, v)| (n, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parsed request line plus headers.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: Method,
    /// Raw request target exactly as received (origin-form or absolute-form).
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

impl RequestHead {
    /// Host header value, if present.
    pub fn host(&self) -> Option<&str> {
        self.headers.get_str("host")
    }
}

/// Parsed status line plus headers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        ResponseHead {
            status,
            version: Version::HTTP_11,
            headers: Headers::new(),
        }
    }
}

/// One decoded unit of an inbound request stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPart {
    Head(RequestHead),
    Body(Bytes),
    End,
}

/// One decoded unit of an upstream response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    Head(ResponseHead),
    Body(Bytes),
    End,
}

fn version_text(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

pub fn encode_request_head(head: &RequestHead) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.extend_from_slice(head.method.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(head.target.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(version_text(head.version).as_bytes());
    buf.extend_from_slice(b"\r\n");
    encode_headers(&head.headers, &mut buf);
    buf.freeze()
}

pub fn encode_response_head(head: &ResponseHead) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.extend_from_slice(version_text(head.version).as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(head.status.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(head.status.canonical_reason().unwrap_or("").as_bytes());
    buf.extend_from_slice(b"\r\n");
    encode_headers(&head.headers, &mut buf);
    buf.freeze()
}

fn encode_headers(headers: &Headers, buf: &mut BytesMut) {
    for (name, value) in headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
}

/// Parses a Content-Length header if one is present.
pub(crate) fn content_length(headers: &Headers) -> Result<Option<u64>, ProtocolError> {
    let value = match headers.get(http::header::CONTENT_LENGTH.as_str()) {
        Some(v) => v,
        None => return Ok(None),
    };
    let text = value
        .to_str()
        .map_err(|_| ProtocolError::InvalidHeader("content-length is not ASCII".into()))?;
    let length = text.trim().parse::<u64>().map_err(|_| {
        ProtocolError::InvalidHeader(format!("invalid content-length '{}'", text.trim()))
    })?;
    Ok(Some(length))
}

pub(crate) fn is_chunked(headers: &Headers) -> bool {
    headers
        .get_str(http::header::TRANSFER_ENCODING.as_str())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}
