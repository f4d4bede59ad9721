//! Incremental decoders. Each decoder retains unconsumed bytes across calls
//! and resumes parsing where the previous read stopped.

use bytes::{Buf, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};

use crate::error::ProtocolError;

use super::{
    content_length, is_chunked, Headers, RequestHead, RequestPart, ResponseHead, ResponsePart,
    MAX_HEAD_BYTES,
};

const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy)]
enum Phase {
    Head,
    Body(Framing),
    Done,
}

#[derive(Debug, Clone, Copy)]
enum Framing {
    Sized { remaining: u64 },
    UntilEof,
}

/// Decoder for the inbound request stream of one connection.
#[derive(Debug)]
pub struct RequestDecoder {
    buf: BytesMut,
    phase: Phase,
    max_head: usize,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self::with_head_limit(MAX_HEAD_BYTES)
    }

    pub fn with_head_limit(max_head: usize) -> Self {
        RequestDecoder {
            buf: BytesMut::new(),
            phase: Phase::Head,
            max_head,
        }
    }

    /// Feeds bytes from the transport and returns every part that is now
    /// complete, in arrival order.
    pub fn decode(&mut self, input: &[u8]) -> Result<Vec<RequestPart>, ProtocolError> {
        self.buf.extend_from_slice(input);
        self.drain()
    }

    /// Signals end-of-stream. A clean close between requests yields nothing;
    /// a close mid-message is a protocol error.
    pub fn eof(&mut self) -> Result<Vec<RequestPart>, ProtocolError> {
        match self.phase {
            Phase::Head if self.buf.is_empty() => Ok(Vec::new()),
            Phase::Head | Phase::Body(_) => Err(ProtocolError::UnexpectedEof),
            Phase::Done => Ok(Vec::new()),
        }
    }

    fn drain(&mut self) -> Result<Vec<RequestPart>, ProtocolError> {
        let mut parts = Vec::new();
        loop {
            match self.phase {
                Phase::Head => {
                    let (head, consumed) = match parse_request_head(&self.buf, self.max_head)? {
                        Some(parsed) => parsed,
                        None => break,
                    };
                    self.buf.advance(consumed);
                    let framing = request_framing(&head)?;
                    parts.push(RequestPart::Head(head));
                    match framing {
                        Some(framing) => self.phase = Phase::Body(framing),
                        None => {
                            parts.push(RequestPart::End);
                            self.phase = Phase::Done;
                        }
                    }
                }
                Phase::Body(Framing::Sized { remaining }) => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let chunk = self.buf.split_to(take).freeze();
                    parts.push(RequestPart::Body(chunk));
                    let left = remaining - take as u64;
                    if left == 0 {
                        parts.push(RequestPart::End);
                        self.phase = Phase::Done;
                    } else {
                        self.phase = Phase::Body(Framing::Sized { remaining: left });
                        break;
                    }
                }
                Phase::Body(Framing::UntilEof) => {
                    // requests are never read-to-close; unreachable by framing
                    if !self.buf.is_empty() {
                        let len = self.buf.len();
                        parts.push(RequestPart::Body(self.buf.split_to(len).freeze()));
                    }
                    break;
                }
                Phase::Done => break,
            }
        }
        Ok(parts)
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder for an upstream response stream.
#[derive(Debug)]
pub struct ResponseDecoder {
    buf: BytesMut,
    phase: Phase,
    max_head: usize,
    head_request: bool,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        ResponseDecoder {
            buf: BytesMut::new(),
            phase: Phase::Head,
            max_head: MAX_HEAD_BYTES,
            head_request: false,
        }
    }

    /// Decoder aware of the request method it answers; responses to HEAD
    /// carry headers only, whatever Content-Length claims.
    pub fn for_request(method: &Method) -> Self {
        ResponseDecoder {
            head_request: *method == Method::HEAD,
            ..Self::new()
        }
    }

    pub fn decode(&mut self, input: &[u8]) -> Result<Vec<ResponsePart>, ProtocolError> {
        self.buf.extend_from_slice(input);
        self.drain()
    }

    /// Signals end-of-stream. Close-delimited bodies complete here; a close
    /// before or inside a length-framed message is a protocol error.
    pub fn eof(&mut self) -> Result<Vec<ResponsePart>, ProtocolError> {
        match self.phase {
            Phase::Head | Phase::Body(Framing::Sized { .. }) => Err(ProtocolError::UnexpectedEof),
            Phase::Body(Framing::UntilEof) => {
                let mut parts = Vec::new();
                if !self.buf.is_empty() {
                    let len = self.buf.len();
                    parts.push(ResponsePart::Body(self.buf.split_to(len).freeze()));
                }
                parts.push(ResponsePart::End);
                self.phase = Phase::Done;
                Ok(parts)
            }
            Phase::Done => Ok(Vec::new()),
        }
    }

    fn drain(&mut self) -> Result<Vec<ResponsePart>, ProtocolError> {
        let mut parts = Vec::new();
        loop {
            match self.phase {
                Phase::Head => {
                    let (head, consumed) = match parse_response_head(&self.buf, self.max_head)? {
                        Some(parsed) => parsed,
                        None => break,
                    };
                    self.buf.advance(consumed);
                    let framing = response_framing(&head, self.head_request)?;
                    parts.push(ResponsePart::Head(head));
                    match framing {
                        Some(framing) => self.phase = Phase::Body(framing),
                        None => {
                            parts.push(ResponsePart::End);
                            self.phase = Phase::Done;
                        }
                    }
                }
                Phase::Body(Framing::Sized { remaining }) => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let chunk = self.buf.split_to(take).freeze();
                    parts.push(ResponsePart::Body(chunk));
                    let left = remaining - take as u64;
                    if left == 0 {
                        parts.push(ResponsePart::End);
                        self.phase = Phase::Done;
                    } else {
                        self.phase = Phase::Body(Framing::Sized { remaining: left });
                        break;
                    }
                }
                Phase::Body(Framing::UntilEof) => {
                    if !self.buf.is_empty() {
                        let len = self.buf.len();
                        parts.push(ResponsePart::Body(self.buf.split_to(len).freeze()));
                    }
                    break;
                }
                Phase::Done => break,
            }
        }
        Ok(parts)
    }
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_request_head(
    buf: &[u8],
    max_head: usize,
) -> Result<Option<(RequestHead, usize)>, ProtocolError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut slots);
    match req.parse(buf)? {
        httparse::Status::Partial => {
            if buf.len() >= max_head {
                return Err(ProtocolError::HeadTooLarge { limit: max_head });
            }
            Ok(None)
        }
        httparse::Status::Complete(consumed) => {
            if consumed > max_head {
                return Err(ProtocolError::HeadTooLarge { limit: max_head });
            }
            let method_text = req
                .method
                .ok_or_else(|| ProtocolError::InvalidHeader("missing method".into()))?;
            let method = Method::from_bytes(method_text.as_bytes()).map_err(|_| {
                ProtocolError::InvalidHeader(format!("invalid method '{}'", method_text))
            })?;
            let target = req
                .path
                .ok_or_else(|| ProtocolError::InvalidHeader("missing request target".into()))?
                .to_string();
            let version = parse_version(req.version)?;
            let headers = collect_headers(req.headers)?;
            Ok(Some((
                RequestHead {
                    method,
                    target,
                    version,
                    headers,
                },
                consumed,
            )))
        }
    }
}

fn parse_response_head(
    buf: &[u8],
    max_head: usize,
) -> Result<Option<(ResponseHead, usize)>, ProtocolError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut slots);
    match resp.parse(buf)? {
        httparse::Status::Partial => {
            if buf.len() >= max_head {
                return Err(ProtocolError::HeadTooLarge { limit: max_head });
            }
            Ok(None)
        }
        httparse::Status::Complete(consumed) => {
            let code = resp
                .code
                .ok_or_else(|| ProtocolError::InvalidHeader("missing status code".into()))?;
            let status =
                StatusCode::from_u16(code).map_err(|_| ProtocolError::InvalidStatus(code))?;
            let version = parse_version(resp.version)?;
            let headers = collect_headers(resp.headers)?;
            Ok(Some((
                ResponseHead {
                    status,
                    version,
                    headers,
                },
                consumed,
            )))
        }
    }
}

fn parse_version(version: Option<u8>) -> Result<Version, ProtocolError> {
    match version {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        Some(other) => Err(ProtocolError::UnsupportedVersion(other)),
        None => Err(ProtocolError::InvalidHeader("missing HTTP version".into())),
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<Headers, ProtocolError> {
    let mut headers = Headers::new();
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| {
            ProtocolError::InvalidHeader(format!("invalid header name '{}'", header.name))
        })?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| {
            ProtocolError::InvalidHeader(format!("invalid value for header '{}'", header.name))
        })?;
        headers.push(name, value);
    }
    Ok(headers)
}

fn request_framing(head: &RequestHead) -> Result<Option<Framing>, ProtocolError> {
    if let Some(te) = head
        .headers
        .get_str(http::header::TRANSFER_ENCODING.as_str())
    {
        return Err(ProtocolError::UnsupportedTransferEncoding(te.to_string()));
    }
    match content_length(&head.headers)? {
        Some(n) if n > 0 => Ok(Some(Framing::Sized { remaining: n })),
        _ => Ok(None),
    }
}

fn response_framing(head: &ResponseHead, head_request: bool) -> Result<Option<Framing>, ProtocolError> {
    if head_request
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return Ok(None);
    }
    if is_chunked(&head.headers) {
        // chunk framing is relayed verbatim; the upstream side always runs
        // close-delimited, so EOF marks the end of the message
        return Ok(Some(Framing::UntilEof));
    }
    match content_length(&head.headers)? {
        Some(0) => Ok(None),
        Some(n) => Ok(Some(Framing::Sized { remaining: n })),
        None => Ok(Some(Framing::UntilEof)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_request_head, encode_response_head};
    use bytes::Bytes;

    fn body_of(parts: &[RequestPart]) -> Vec<u8> {
        let mut out = Vec::new();
        for part in parts {
            if let RequestPart::Body(chunk) = part {
                out.extend_from_slice(chunk);
            }
        }
        out
    }

    #[test]
    fn parses_request_with_body_from_one_buffer() {
        let mut decoder = RequestDecoder::new();
        let parts = decoder
            .decode(b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();

        match &parts[0] {
            RequestPart::Head(head) => {
                assert_eq!(head.method, Method::POST);
                assert_eq!(head.target, "/submit");
                assert_eq!(head.version, Version::HTTP_11);
                assert_eq!(head.host(), Some("example.com"));
            }
            other => panic!("expected head, got {:?}", other),
        }
        assert_eq!(body_of(&parts), b"hello");
        assert_eq!(parts.last(), Some(&RequestPart::End));
    }

    #[test]
    fn parses_request_without_body() {
        let mut decoder = RequestDecoder::new();
        let parts = decoder
            .decode(b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap();
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[0], RequestPart::Head(_)));
        assert_eq!(parts[1], RequestPart::End);
    }

    #[test]
    fn reassembles_request_fed_byte_by_byte() {
        let raw = b"POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\n\r\nabcd";
        let mut decoder = RequestDecoder::new();
        let mut parts = Vec::new();
        for byte in raw.iter() {
            parts.extend(decoder.decode(std::slice::from_ref(byte)).unwrap());
        }

        assert!(matches!(parts[0], RequestPart::Head(_)));
        assert_eq!(body_of(&parts), b"abcd");
        assert_eq!(parts.last(), Some(&RequestPart::End));
    }

    #[test]
    fn absolute_form_target_is_kept_raw() {
        let mut decoder = RequestDecoder::new();
        let parts = decoder
            .decode(b"GET https://example.com/test HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap();
        match &parts[0] {
            RequestPart::Head(head) => assert_eq!(head.target, "https://example.com/test"),
            other => panic!("expected head, got {:?}", other),
        }
    }

    #[test]
    fn round_trips_a_single_buffer_request() {
        let mut headers = Headers::new();
        headers.push(
            HeaderName::from_static("host"),
            HeaderValue::from_static("example.com:8081"),
        );
        headers.push(
            HeaderName::from_static("content-length"),
            HeaderValue::from_static("3"),
        );
        let head = RequestHead {
            method: Method::PUT,
            target: "/item/9".to_string(),
            version: Version::HTTP_11,
            headers,
        };

        let mut wire = encode_request_head(&head).to_vec();
        wire.extend_from_slice(b"xyz");

        let mut decoder = RequestDecoder::new();
        let parts = decoder.decode(&wire).unwrap();
        assert_eq!(parts[0], RequestPart::Head(head));
        assert_eq!(body_of(&parts), b"xyz");
        assert_eq!(parts.last(), Some(&RequestPart::End));
    }

    #[test]
    fn round_trips_a_single_buffer_response() {
        let mut headers = Headers::new();
        headers.push(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("text/plain"),
        );
        headers.push(
            HeaderName::from_static("content-length"),
            HeaderValue::from_static("2"),
        );
        let head = ResponseHead {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers,
        };

        let mut wire = encode_response_head(&head).to_vec();
        wire.extend_from_slice(b"ok");

        let mut decoder = ResponseDecoder::new();
        let parts = decoder.decode(&wire).unwrap();
        assert_eq!(parts[0], ResponsePart::Head(head));
        assert_eq!(parts[1], ResponsePart::Body(Bytes::from_static(b"ok")));
        assert_eq!(parts[2], ResponsePart::End);
    }

    #[test]
    fn rejects_malformed_request_line() {
        let mut decoder = RequestDecoder::new();
        let err = decoder
            .decode(b"NOT A VALID REQUEST\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHead(_)));
    }

    #[test]
    fn rejects_oversized_head() {
        let mut decoder = RequestDecoder::with_head_limit(64);
        let mut raw = b"GET / HTTP/1.1\r\nx-filler: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(128));
        let err = decoder.decode(&raw).unwrap_err();
        assert!(matches!(err, ProtocolError::HeadTooLarge { limit: 64 }));
    }

    #[test]
    fn rejects_chunked_request_body() {
        let mut decoder = RequestDecoder::new();
        let err = decoder
            .decode(b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedTransferEncoding(_)));
    }

    #[test]
    fn rejects_invalid_content_length() {
        let mut decoder = RequestDecoder::new();
        let err = decoder
            .decode(b"POST / HTTP/1.1\r\nContent-Length: banana\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHeader(_)));
    }

    #[test]
    fn eof_mid_body_is_an_error() {
        let mut decoder = RequestDecoder::new();
        decoder
            .decode(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc")
            .unwrap();
        assert!(matches!(decoder.eof(), Err(ProtocolError::UnexpectedEof)));
    }

    #[test]
    fn eof_between_requests_is_clean() {
        let mut decoder = RequestDecoder::new();
        assert!(decoder.eof().unwrap().is_empty());
    }

    #[test]
    fn response_without_length_runs_to_eof() {
        let mut decoder = ResponseDecoder::new();
        let parts = decoder
            .decode(b"HTTP/1.1 200 OK\r\nserver: stub\r\n\r\nfirst")
            .unwrap();
        assert!(matches!(parts[0], ResponsePart::Head(_)));
        assert_eq!(parts[1], ResponsePart::Body(Bytes::from_static(b"first")));

        let more = decoder.decode(b"-second").unwrap();
        assert_eq!(more, vec![ResponsePart::Body(Bytes::from_static(b"-second"))]);

        let end = decoder.eof().unwrap();
        assert_eq!(end, vec![ResponsePart::End]);
    }

    #[test]
    fn chunked_response_is_relayed_verbatim_until_eof() {
        let mut decoder = ResponseDecoder::new();
        let raw = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n4\r\nwiki\r\n0\r\n\r\n";
        let parts = decoder.decode(raw).unwrap();
        assert!(matches!(parts[0], ResponsePart::Head(_)));
        assert_eq!(
            parts[1],
            ResponsePart::Body(Bytes::from_static(b"4\r\nwiki\r\n0\r\n\r\n"))
        );
        assert_eq!(decoder.eof().unwrap(), vec![ResponsePart::End]);
    }

    #[test]
    fn no_content_response_ends_at_head() {
        let mut decoder = ResponseDecoder::new();
        let parts = decoder
            .decode(b"HTTP/1.1 204 No Content\r\nserver: stub\r\n\r\n")
            .unwrap();
        assert!(matches!(parts[0], ResponsePart::Head(_)));
        assert_eq!(parts[1], ResponsePart::End);
    }

    #[test]
    fn head_response_ignores_content_length() {
        let mut decoder = ResponseDecoder::for_request(&Method::HEAD);
        let parts = decoder
            .decode(b"HTTP/1.1 200 OK\r\ncontent-length: 1234\r\n\r\n")
            .unwrap();
        assert!(matches!(parts[0], ResponsePart::Head(_)));
        assert_eq!(parts[1], ResponsePart::End);
    }

    #[test]
    fn response_eof_before_head_is_an_error() {
        let mut decoder = ResponseDecoder::new();
        assert!(matches!(decoder.eof(), Err(ProtocolError::UnexpectedEof)));
    }

    #[test]
    fn headers_keep_order_and_duplicates() {
        let mut decoder = RequestDecoder::new();
        let parts = decoder
            .decode(
                b"GET / HTTP/1.1\r\nHost: a\r\nAccept: text/html\r\nCookie: one=1\r\nCookie: two=2\r\n\r\n",
            )
            .unwrap();
        let head = match &parts[0] {
            RequestPart::Head(head) => head,
            other => panic!("expected head, got {:?}", other),
        };
        let names: Vec<&str> = head.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["host", "accept", "cookie", "cookie"]);
    }
}
