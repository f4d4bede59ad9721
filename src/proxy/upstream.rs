//! Upstream relay: connects to origins and streams their responses back.
//!
//! Every allowed request gets a fresh origin connection; the proxied
//! request always carries `Connection: close`, so the origin's EOF
//! delimits responses that declare no length.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::StatusCode;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::codec::{
    encode_request_head, Headers, RequestHead, ResponseDecoder, ResponseHead, ResponsePart,
};
use crate::config::ProxyConfig;
use crate::error::UpstreamError;
use crate::tls::upstream_client_config;
use crate::utils::{default_port, is_absolute_form, origin_form, upstream_authority};

const READ_CHUNK: usize = 8 * 1024;

/// Boxed stream bound shared by plain TCP and TLS origin connections.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpstreamIo for T {}

/// Where a request is forwarded, and the Host value it travels with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    /// Host to dial.
    pub host: String,
    /// Port to dial.
    pub port: u16,
    /// Whether the origin connection speaks TLS.
    pub tls: bool,
    /// Exact Host header value sent upstream.
    pub host_header: String,
}

impl ForwardTarget {
    /// Derives the target from a decoded request.
    ///
    /// Absolute-form targets name their own authority and scheme; for
    /// origin-form the Host header and the listener's scheme decide.
    /// An explicit non-default port in the authority is kept in the
    /// forwarded Host header.
    pub fn from_request(head: &RequestHead, listener_tls: bool) -> Result<Self, UpstreamError> {
        let (host, port) = upstream_authority(head, listener_tls)?;
        let tls = if is_absolute_form(&head.target) {
            head.target.starts_with("https://")
        } else {
            listener_tls
        };

        let host_header = if is_absolute_form(&head.target) {
            if port == default_port(tls) {
                host.clone()
            } else {
                format!("{host}:{port}")
            }
        } else {
            match head.host() {
                Some(value) => value.to_string(),
                None => {
                    return Err(UpstreamError::InvalidTarget(
                        "request carries no Host header".to_string(),
                    ))
                }
            }
        };

        Ok(Self {
            host,
            port,
            tls,
            host_header,
        })
    }
}

enum BodySource {
    /// Live origin socket still being decoded.
    Streaming {
        io: Box<dyn UpstreamIo>,
        decoder: ResponseDecoder,
        pending: VecDeque<ResponsePart>,
        eof_seen: bool,
    },
    /// Fully buffered body for locally built responses.
    Buffered(Option<Bytes>),
}

/// A response on its way back to the client, pulled part by part.
pub struct UpstreamResponse {
    pub head: ResponseHead,
    body: BodySource,
}

impl UpstreamResponse {
    /// A complete `text/plain` response built locally.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let body = Bytes::from(body.into());
        let mut head = ResponseHead::new(status);
        head.headers.push(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        head.headers
            .push(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        head.headers
            .push(header::CONNECTION, HeaderValue::from_static("close"));
        Self {
            head,
            body: BodySource::Buffered(Some(body)),
        }
    }

    /// Next body chunk, or `None` once the body is complete.
    ///
    /// For streamed responses the bytes are exactly what the origin sent,
    /// chunked framing included.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, UpstreamError> {
        match &mut self.body {
            BodySource::Buffered(slot) => Ok(slot.take().filter(|bytes| !bytes.is_empty())),
            BodySource::Streaming {
                io,
                decoder,
                pending,
                eof_seen,
            } => loop {
                while let Some(part) = pending.pop_front() {
                    match part {
                        // The head was consumed when the relay started.
                        ResponsePart::Head(_) => continue,
                        ResponsePart::Body(bytes) => return Ok(Some(bytes)),
                        ResponsePart::End => return Ok(None),
                    }
                }
                if *eof_seen {
                    return Ok(None);
                }

                let mut buf = [0u8; READ_CHUNK];
                let n = io.read(&mut buf).await?;
                if n == 0 {
                    pending.extend(decoder.eof()?);
                    *eof_seen = true;
                } else {
                    pending.extend(decoder.decode(&buf[..n])?);
                }
            },
        }
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Produces the response for an allowed request.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        target: &ForwardTarget,
        url: &str,
        head: &RequestHead,
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

/// Forwards requests to the real origin over a fresh connection.
pub struct TcpForwarder {
    connect_timeout: Duration,
    tls_config: Arc<rustls::ClientConfig>,
}

impl TcpForwarder {
    pub fn new(connect_timeout: Duration, tls_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            connect_timeout,
            tls_config,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            Duration::from_secs(config.upstream.connect_timeout_secs),
            upstream_client_config(config.tls.skip_upstream_verify),
        )
    }

    async fn connect(&self, target: &ForwardTarget) -> Result<Box<dyn UpstreamIo>, UpstreamError> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| UpstreamError::ConnectTimeout {
            host: target.host.clone(),
            port: target.port,
            seconds: self.connect_timeout.as_secs(),
        })?
        .map_err(|source| UpstreamError::Connect {
            host: target.host.clone(),
            port: target.port,
            source,
        })?;

        if !target.tls {
            return Ok(Box::new(stream));
        }

        let server_name =
            rustls::ServerName::try_from(target.host.as_str()).map_err(|_| {
                UpstreamError::InvalidTarget(format!(
                    "not a valid TLS server name: {}",
                    target.host
                ))
            })?;
        let connector = TlsConnector::from(self.tls_config.clone());
        let tls_stream = connector.connect(server_name, stream).await.map_err(
            |source| UpstreamError::TlsHandshake {
                host: target.host.clone(),
                source,
            },
        )?;
        Ok(Box::new(tls_stream))
    }
}

#[async_trait]
impl Forwarder for TcpForwarder {
    async fn forward(
        &self,
        target: &ForwardTarget,
        _url: &str,
        head: &RequestHead,
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let head = prepare_head(head, target, body.len())?;
        let mut io = self.connect(target).await?;
        debug!(
            "forwarding {} {} to {}:{}",
            head.method, head.target, target.host, target.port
        );

        io.write_all(&encode_request_head(&head)).await?;
        if !body.is_empty() {
            io.write_all(&body).await?;
        }
        io.flush().await?;

        // Read until the response head arrives; whatever body parts came
        // in the same reads are kept for the relay.
        let mut decoder = ResponseDecoder::for_request(&head.method);
        let mut pending: VecDeque<ResponsePart> = VecDeque::new();
        let mut eof_seen = false;
        let response_head = loop {
            // the decoder always emits the head before any body part
            if let Some(ResponsePart::Head(found)) = pending.pop_front() {
                break found;
            }
            if eof_seen {
                return Err(crate::error::ProtocolError::UnexpectedEof.into());
            }

            let mut buf = [0u8; READ_CHUNK];
            let n = io.read(&mut buf).await?;
            if n == 0 {
                pending.extend(decoder.eof()?);
                eof_seen = true;
            } else {
                pending.extend(decoder.decode(&buf[..n])?);
            }
        };

        Ok(UpstreamResponse {
            head: response_head,
            body: BodySource::Streaming {
                io,
                decoder,
                pending,
                eof_seen,
            },
        })
    }
}

/// Answers allowed requests locally instead of contacting the origin.
/// Keeps filter behaviour observable without any network egress.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalResponder;

#[async_trait]
impl Forwarder for LocalResponder {
    async fn forward(
        &self,
        _target: &ForwardTarget,
        url: &str,
        _head: &RequestHead,
        _body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError> {
        Ok(UpstreamResponse::text(
            StatusCode::OK,
            format!("Request allowed: {url}"),
        ))
    }
}

/// Rewrites a request head for the origin: origin-form target, explicit
/// Host, hop-by-hop headers stripped, `Connection: close` appended.
fn prepare_head(
    head: &RequestHead,
    target: &ForwardTarget,
    body_len: usize,
) -> Result<RequestHead, UpstreamError> {
    let host_value = HeaderValue::from_str(&target.host_header).map_err(|_| {
        UpstreamError::InvalidTarget(format!("unusable Host value: {}", target.host_header))
    })?;

    let mut headers = Headers::new();
    headers.push(header::HOST, host_value);
    for (name, value) in head.headers.iter() {
        if name == header::HOST || is_hop_by_hop(name.as_str()) {
            continue;
        }
        headers.push(name.clone(), value.clone());
    }
    headers.set(header::CONNECTION, HeaderValue::from_static("close"));
    if body_len > 0 {
        headers.set(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    }

    Ok(RequestHead {
        method: head.method.clone(),
        target: origin_form(&head.target)?,
        version: head.version,
        headers,
    })
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderName;
    use http::{Method, Version};

    fn request(target: &str, host: Option<&str>) -> RequestHead {
        let mut headers = Headers::new();
        if let Some(host) = host {
            headers.push(header::HOST, HeaderValue::from_str(host).unwrap());
        }
        headers.push(
            HeaderName::from_static("x-trace"),
            HeaderValue::from_static("abc"),
        );
        headers.push(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        RequestHead {
            method: Method::GET,
            target: target.to_string(),
            version: Version::HTTP_11,
            headers,
        }
    }

    #[test]
    fn target_comes_from_absolute_form_url() {
        let head = request("http://origin.net:8080/x", Some("ignored.example"));
        let target = ForwardTarget::from_request(&head, false).unwrap();
        assert_eq!(target.host, "origin.net");
        assert_eq!(target.port, 8080);
        assert!(!target.tls);
        assert_eq!(target.host_header, "origin.net:8080");
    }

    #[test]
    fn origin_form_target_uses_host_header_and_listener_scheme() {
        let head = request("/path", Some("origin.net:9443"));
        let target = ForwardTarget::from_request(&head, true).unwrap();
        assert_eq!(target.host, "origin.net");
        assert_eq!(target.port, 9443);
        assert!(target.tls);
        assert_eq!(target.host_header, "origin.net:9443");

        let head = request("/path", Some("origin.net"));
        let target = ForwardTarget::from_request(&head, false).unwrap();
        assert_eq!(target.port, 80);
        assert_eq!(target.host_header, "origin.net");
    }

    #[test]
    fn prepared_head_rewrites_host_and_connection() {
        let head = request("http://origin.net/a?b=c", Some("client-facing.example"));
        let target = ForwardTarget::from_request(&head, false).unwrap();
        let prepared = prepare_head(&head, &target, 0).unwrap();

        assert_eq!(prepared.target, "/a?b=c");
        assert_eq!(prepared.headers.get_str("host"), Some("origin.net"));
        assert_eq!(prepared.headers.get_str("connection"), Some("close"));
        // end-to-end headers survive, hop-by-hop ones do not
        assert_eq!(prepared.headers.get_str("x-trace"), Some("abc"));
        let connections: Vec<_> = prepared
            .headers
            .iter()
            .filter(|(name, _)| *name == header::CONNECTION)
            .collect();
        assert_eq!(connections.len(), 1);
    }

    #[test]
    fn prepared_head_sets_content_length_for_bodies() {
        let head = request("/upload", Some("origin.net"));
        let target = ForwardTarget::from_request(&head, false).unwrap();
        let prepared = prepare_head(&head, &target, 11).unwrap();
        assert_eq!(prepared.headers.get_str("content-length"), Some("11"));
    }

    #[tokio::test]
    async fn text_response_yields_body_once() {
        let mut response = UpstreamResponse::text(StatusCode::OK, "Request allowed: http://x/");
        assert_eq!(response.head.status, StatusCode::OK);
        assert_eq!(response.head.headers.get_str("content-length"), Some("26"));

        let chunk = response.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"Request allowed: http://x/");
        assert!(response.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_responder_echoes_the_url() {
        let head = request("http://example.com/", Some("example.com"));
        let target = ForwardTarget::from_request(&head, false).unwrap();
        let mut response = LocalResponder
            .forward(&target, "http://example.com/", &head, Bytes::new())
            .await
            .unwrap();

        let chunk = response.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"Request allowed: http://example.com/");
    }

    #[tokio::test]
    async fn forwarder_rewrites_the_head_for_a_live_origin() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let origin = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.ends_with(b"ping") {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "origin saw EOF before the full request");
                received.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8(received).unwrap()
        });

        let mut head = request("/data", Some("origin.test"));
        head.method = Method::POST;
        let target = ForwardTarget {
            host: addr.ip().to_string(),
            port: addr.port(),
            tls: false,
            host_header: "origin.test".to_string(),
        };
        let forwarder =
            TcpForwarder::new(Duration::from_secs(5), upstream_client_config(false));
        let mut response = forwarder
            .forward(&target, "http://origin.test/data", &head, Bytes::from("ping"))
            .await
            .unwrap();

        assert_eq!(response.head.status, StatusCode::OK);
        let mut body = Vec::new();
        while let Some(chunk) = response.next_chunk().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(&body[..], b"hello");

        let sent = origin.await.unwrap();
        assert!(sent.starts_with("POST /data HTTP/1.1\r\n"), "sent: {sent}");
        assert!(sent.contains("host: origin.test\r\n"), "sent: {sent}");
        assert!(sent.contains("connection: close\r\n"), "sent: {sent}");
        assert!(sent.contains("content-length: 4\r\n"), "sent: {sent}");
    }

    #[tokio::test]
    async fn refused_connection_surfaces_as_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let head = request("/", Some("origin.test"));
        let target = ForwardTarget {
            host: addr.ip().to_string(),
            port: addr.port(),
            tls: false,
            host_header: "origin.test".to_string(),
        };
        let forwarder =
            TcpForwarder::new(Duration::from_secs(2), upstream_client_config(false));
        let err = forwarder
            .forward(&target, "http://origin.test/", &head, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Connect { .. }), "got: {err}");
    }
}
