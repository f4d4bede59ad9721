//! Per-connection state machine.
//!
//! Each accepted connection serves exactly one request and is then
//! closed. The handler walks the connection through its states, makes
//! the allow/block decision exactly once per request, and publishes the
//! request, decision, and response events to the log sink.

use http::header::{self, HeaderValue};
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::codec::{encode_response_head, RequestDecoder, RequestPart};
use crate::config::LimitSettings;
use crate::error::{ProtocolError, UpstreamError};
use crate::filter::FilterEngine;
use crate::logging::LogSink;
use crate::models::{ConnectionState, LogEvent, RequestContext};
use crate::proxy::upstream::{ForwardTarget, Forwarder, UpstreamResponse};
use crate::utils::filter_url;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("client connection error: {0}")]
    Io(#[from] std::io::Error),
}

/// Drives one client connection from first byte to close.
pub struct ConnectionHandler {
    filter: Arc<FilterEngine>,
    forwarder: Arc<dyn Forwarder>,
    sink: Arc<dyn LogSink>,
    limits: LimitSettings,
    listener_tls: bool,
}

impl ConnectionHandler {
    pub fn new(
        filter: Arc<FilterEngine>,
        forwarder: Arc<dyn Forwarder>,
        sink: Arc<dyn LogSink>,
        limits: LimitSettings,
        listener_tls: bool,
    ) -> Self {
        Self {
            filter,
            forwarder,
            sink,
            limits,
            listener_tls,
        }
    }

    /// Serves the connection to completion. Never panics the task; every
    /// failure ends in one error event and a closed socket.
    pub async fn run<S>(&self, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut ctx = RequestContext::new(peer);
        debug!("connection opened from {}", peer);

        if let Err(err) = self.serve(&mut stream, &mut ctx).await {
            let subject = match ctx.target() {
                Some(target) => format!("{} {} from {}", ctx.method_text(), target, peer),
                None => format!("connection from {}", peer),
            };
            self.sink.publish(LogEvent::error(format!(
                "{} failed while {}: {}",
                subject, ctx.state, err
            )));
        }

        ctx.state = ConnectionState::Closed;
        let _ = stream.shutdown().await;
        debug!("connection closed from {}", peer);
    }

    async fn serve<S>(
        &self,
        stream: &mut S,
        ctx: &mut RequestContext,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        if let Err(err) = self.read_request(stream, ctx).await {
            // An oversized body gets a 413 because the head already parsed;
            // anything else is unparseable framing and gets no response at
            // all. Best effort either way; the read error is what counts.
            if let ConnectionError::Protocol(ProtocolError::BodyTooLarge { limit }) = &err {
                let text = format!("Payload Too Large: body exceeds {limit} bytes");
                let _ = self
                    .reply(
                        stream,
                        ctx,
                        UpstreamResponse::text(StatusCode::PAYLOAD_TOO_LARGE, text),
                    )
                    .await;
            }
            return Err(err);
        }

        let Some(head) = ctx.head.clone() else {
            // Closed cleanly before sending anything.
            debug!("connection from {} closed before a request", ctx.peer);
            return Ok(());
        };

        let Some(host) = head.host().map(str::to_string) else {
            self.reply(
                stream,
                ctx,
                UpstreamResponse::text(
                    StatusCode::BAD_REQUEST,
                    "Bad Request: missing Host header",
                ),
            )
            .await?;
            self.sink.publish(LogEvent::error(format!(
                "request from {} carried no Host header",
                ctx.peer
            )));
            return Ok(());
        };

        let url = filter_url(&host, &head.target, self.listener_tls);
        let allowed = self.filter.decide(&url);
        self.sink.publish(LogEvent::info(format!(
            "{} {}",
            if allowed { "allowed" } else { "blocked" },
            url
        )));

        if !allowed {
            ctx.state = ConnectionState::RejectingLocally;
            let status = self
                .reply(
                    stream,
                    ctx,
                    UpstreamResponse::text(
                        StatusCode::FORBIDDEN,
                        format!("Request blocked: {url}"),
                    ),
                )
                .await?;
            self.sink.publish(LogEvent::response(format!(
                "{} {} in {}ms",
                status.as_u16(),
                url,
                ctx.elapsed_ms()
            )));
            return Ok(());
        }

        ctx.state = ConnectionState::ForwardingUpstream;
        let target = match ForwardTarget::from_request(&head, self.listener_tls) {
            Ok(target) => target,
            Err(err) => {
                let _ = self
                    .reply(
                        stream,
                        ctx,
                        UpstreamResponse::text(
                            StatusCode::BAD_REQUEST,
                            format!("Bad Request: {err}"),
                        ),
                    )
                    .await;
                return Err(err.into());
            }
        };

        let body = std::mem::take(&mut ctx.body).freeze();
        match self.forwarder.forward(&target, &url, &head, body).await {
            Ok(response) => {
                let status = self.reply(stream, ctx, response).await?;
                self.sink.publish(LogEvent::response(format!(
                    "{} {} in {}ms",
                    status.as_u16(),
                    url,
                    ctx.elapsed_ms()
                )));
                Ok(())
            }
            Err(err) => {
                let (status, text) = match &err {
                    UpstreamError::InvalidTarget(reason) => (
                        StatusCode::BAD_REQUEST,
                        format!("Bad Request: {reason}"),
                    ),
                    other => (StatusCode::BAD_GATEWAY, format!("Bad Gateway: {other}")),
                };
                let _ = self
                    .reply(stream, ctx, UpstreamResponse::text(status, text))
                    .await;
                Err(err.into())
            }
        }
    }

    /// Reads and decodes one full request into the context.
    async fn read_request<S>(
        &self,
        stream: &mut S,
        ctx: &mut RequestContext,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut decoder = RequestDecoder::with_head_limit(self.limits.max_head_bytes);
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = stream.read(&mut buf).await?;
            let parts = if n == 0 {
                decoder.eof()?
            } else {
                decoder.decode(&buf[..n])?
            };

            for part in parts {
                match part {
                    RequestPart::Head(head) => {
                        self.sink.publish(
                            LogEvent::request(format!(
                                "{} {} from {}",
                                head.method, head.target, ctx.peer
                            ))
                            .with_headers(&head.headers),
                        );
                        ctx.head = Some(head);
                        ctx.state = ConnectionState::AccumulatingBody;
                    }
                    RequestPart::Body(chunk) => {
                        if ctx.body.len() + chunk.len() > self.limits.max_body_bytes {
                            return Err(ProtocolError::BodyTooLarge {
                                limit: self.limits.max_body_bytes,
                            }
                            .into());
                        }
                        ctx.body.extend_from_slice(&chunk);
                    }
                    RequestPart::End => {
                        ctx.state = ConnectionState::Deciding;
                        return Ok(());
                    }
                }
            }

            if n == 0 {
                // EOF with no decode error: the client closed cleanly
                // before (or instead of) sending a request.
                return Ok(());
            }
        }
    }

    /// Writes a response to the client, streaming the body as it arrives.
    async fn reply<S>(
        &self,
        stream: &mut S,
        ctx: &mut RequestContext,
        mut response: UpstreamResponse,
    ) -> Result<StatusCode, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        ctx.state = ConnectionState::RelayingResponse;
        response
            .head
            .headers
            .set(header::CONNECTION, HeaderValue::from_static("close"));

        stream.write_all(&encode_response_head(&response.head)).await?;
        while let Some(chunk) = response.next_chunk().await? {
            stream.write_all(&chunk).await?;
        }
        stream.flush().await?;
        Ok(response.head.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitSettings;
    use crate::filter::{FilterEngine, FilterRule};
    use crate::logging::CollectingSink;
    use crate::models::Direction;
    use crate::proxy::upstream::{LocalResponder, TcpForwarder};
    use crate::tls::upstream_client_config;
    use std::time::Duration;
    use tokio::io::duplex;

    fn handler(
        rule: FilterRule,
        sink: Arc<CollectingSink>,
        limits: LimitSettings,
    ) -> ConnectionHandler {
        ConnectionHandler::new(
            Arc::new(FilterEngine::new(rule)),
            Arc::new(LocalResponder),
            sink,
            limits,
            false,
        )
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4321".parse().unwrap()
    }

    async fn roundtrip(handler: ConnectionHandler, request: &[u8]) -> Vec<u8> {
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.run(server, peer()).await });

        client.write_all(request).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        task.await.unwrap();
        response
    }

    #[tokio::test]
    async fn blocked_request_gets_403_with_the_exact_body() {
        let sink = Arc::new(CollectingSink::new());
        let handler = handler(
            FilterRule::block(vec!["blocked.example".to_string()]),
            sink.clone(),
            LimitSettings::default(),
        );

        let response = roundtrip(
            handler,
            b"GET http://blocked.example/ HTTP/1.1\r\nHost: blocked.example\r\n\r\n",
        )
        .await;

        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "got: {text}");
        assert!(text.ends_with("Request blocked: http://blocked.example/"), "got: {text}");

        let events = sink.events();
        let directions: Vec<_> = events.iter().map(|e| e.direction).collect();
        assert_eq!(
            directions,
            vec![Direction::Request, Direction::Info, Direction::Response]
        );
        assert!(events[1].summary.starts_with("blocked "));
    }

    #[tokio::test]
    async fn allowed_request_is_answered_with_the_exact_body() {
        let sink = Arc::new(CollectingSink::new());
        let handler = handler(
            FilterRule::allow(vec!["example.com".to_string()]),
            sink.clone(),
            LimitSettings::default(),
        );

        let response = roundtrip(
            handler,
            b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n",
        )
        .await;

        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
        assert!(text.ends_with("Request allowed: http://example.com/"), "got: {text}");
        assert!(sink.events()[1].summary.starts_with("allowed "));
    }

    #[tokio::test]
    async fn absolute_https_target_is_echoed_verbatim() {
        let sink = Arc::new(CollectingSink::new());
        let handler = handler(
            FilterRule::allow(vec!["example.com".to_string()]),
            sink.clone(),
            LimitSettings::default(),
        );

        let response = roundtrip(
            handler,
            b"GET https://example.com/test HTTP/1.1\r\nHost: example.com\r\n\r\n",
        )
        .await;

        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
        assert!(
            text.ends_with("Request allowed: https://example.com/test"),
            "got: {text}"
        );
    }

    #[tokio::test]
    async fn origin_form_request_is_filtered_by_reconstructed_url() {
        let sink = Arc::new(CollectingSink::new());
        let handler = handler(
            FilterRule::allow(vec!["example.com".to_string()]),
            sink.clone(),
            LimitSettings::default(),
        );

        let response = roundtrip(
            handler,
            b"GET /page HTTP/1.1\r\nHost: example.com\r\n\r\n",
        )
        .await;

        let text = String::from_utf8(response).unwrap();
        assert!(text.ends_with("Request allowed: http://example.com/page"), "got: {text}");
    }

    #[tokio::test]
    async fn missing_host_gets_400() {
        let sink = Arc::new(CollectingSink::new());
        let handler = handler(
            FilterRule::block(vec![]),
            sink.clone(),
            LimitSettings::default(),
        );

        let response = roundtrip(handler, b"GET / HTTP/1.1\r\n\r\n").await;

        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {text}");
        let events = sink.events();
        assert!(events
            .iter()
            .any(|e| e.direction == Direction::Error && e.summary.contains("no Host header")));
    }

    #[tokio::test]
    async fn missing_host_outranks_a_matching_block_rule() {
        let sink = Arc::new(CollectingSink::new());
        let handler = handler(
            FilterRule::block(vec!["blocked.example".to_string()]),
            sink.clone(),
            LimitSettings::default(),
        );

        // Absolute-form target the rule would deny, but no Host header: the
        // client error answers first and no decision is made.
        let response = roundtrip(handler, b"GET http://blocked.example/ HTTP/1.1\r\n\r\n").await;

        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {text}");
        assert!(sink.events().iter().all(|e| e.direction != Direction::Info));
    }

    #[tokio::test]
    async fn oversized_body_gets_413_and_an_error_event() {
        let sink = Arc::new(CollectingSink::new());
        let limits = LimitSettings {
            max_body_bytes: 8,
            ..LimitSettings::default()
        };
        let handler = handler(FilterRule::block(vec![]), sink.clone(), limits);

        let response = roundtrip(
            handler,
            b"POST / HTTP/1.1\r\nHost: example.com\r\nContent-Length: 16\r\n\r\n0123456789abcdef",
        )
        .await;

        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "got: {text}");
        assert!(sink
            .events()
            .iter()
            .any(|e| e.direction == Direction::Error));
    }

    #[tokio::test]
    async fn malformed_head_gets_no_response_but_an_error_event() {
        let sink = Arc::new(CollectingSink::new());
        let handler = handler(
            FilterRule::block(vec![]),
            sink.clone(),
            LimitSettings::default(),
        );

        let response = roundtrip(handler, b"NOT A REQUEST\r\n\r\n").await;

        assert!(response.is_empty(), "got: {:?}", response);
        assert!(sink
            .events()
            .iter()
            .any(|e| e.direction == Direction::Error));
    }

    #[tokio::test]
    async fn empty_allow_list_denies_everything() {
        let sink = Arc::new(CollectingSink::new());
        let handler = handler(
            FilterRule::allow(vec![]),
            sink.clone(),
            LimitSettings::default(),
        );

        let response = roundtrip(
            handler,
            b"GET http://anything.example/ HTTP/1.1\r\nHost: anything.example\r\n\r\n",
        )
        .await;

        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "got: {text}");
        assert!(text.ends_with("Request blocked: http://anything.example/"), "got: {text}");
    }

    #[tokio::test]
    async fn clean_early_close_produces_no_events() {
        let sink = Arc::new(CollectingSink::new());
        let handler = handler(
            FilterRule::block(vec![]),
            sink.clone(),
            LimitSettings::default(),
        );

        let (client, server) = duplex(1024);
        drop(client);
        handler.run(server, peer()).await;

        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn unreachable_upstream_maps_to_502() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = Arc::new(CollectingSink::new());
        let handler = ConnectionHandler::new(
            Arc::new(FilterEngine::new(FilterRule::block(vec![]))),
            Arc::new(TcpForwarder::new(
                Duration::from_secs(2),
                upstream_client_config(false),
            )),
            sink.clone(),
            LimitSettings::default(),
            false,
        );

        let request = format!("GET http://{addr}/ HTTP/1.1\r\nHost: {addr}\r\n\r\n");
        let response = roundtrip(handler, request.as_bytes()).await;

        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "got: {text}");
        assert!(sink
            .events()
            .iter()
            .any(|e| e.direction == Direction::Error));
    }

    #[tokio::test]
    async fn decision_happens_exactly_once_per_request() {
        let sink = Arc::new(CollectingSink::new());
        let handler = handler(
            FilterRule::allow(vec!["example.com".to_string()]),
            sink.clone(),
            LimitSettings::default(),
        );

        roundtrip(
            handler,
            b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n",
        )
        .await;

        let decisions = sink
            .events()
            .iter()
            .filter(|e| e.direction == Direction::Info)
            .count();
        assert_eq!(decisions, 1);
    }
}
