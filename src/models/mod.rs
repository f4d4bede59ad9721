//! Data model shared across the engine: structured log events and the
//! per-connection request context.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

use crate::codec::{Headers, RequestHead};

/// Severity attached to log events, mirrored by the configured log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Rejected log-level text, carrying what was supplied.
#[derive(Error, Debug)]
#[error("unknown log level '{0}', expected debug|info|warning|error")]
pub struct InvalidLogLevel(String);

impl std::str::FromStr for LogLevel {
    type Err = InvalidLogLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            _ => Err(InvalidLogLevel(s.to_string())),
        }
    }
}

/// What a log event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
    Info,
    Error,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => write!(f, "request"),
            Direction::Response => write!(f, "response"),
            Direction::Info => write!(f, "info"),
            Direction::Error => write!(f, "error"),
        }
    }
}

/// One structured event handed to the log sink. Transient; the engine never
/// retains events after publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub level: LogLevel,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<(String, String)>>,
}

impl LogEvent {
    pub fn new(direction: Direction, level: LogLevel, summary: impl Into<String>) -> Self {
        LogEvent {
            timestamp: Utc::now(),
            direction,
            level,
            summary: summary.into(),
            headers: None,
        }
    }

    pub fn request(summary: impl Into<String>) -> Self {
        Self::new(Direction::Request, LogLevel::Info, summary)
    }

    pub fn response(summary: impl Into<String>) -> Self {
        Self::new(Direction::Response, LogLevel::Info, summary)
    }

    pub fn info(summary: impl Into<String>) -> Self {
        Self::new(Direction::Info, LogLevel::Info, summary)
    }

    pub fn error(summary: impl Into<String>) -> Self {
        Self::new(Direction::Error, LogLevel::Error, summary)
    }

    /// Attaches a snapshot of the message headers.
    pub fn with_headers(mut self, headers: &Headers) -> Self {
        self.headers = Some(
            headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        );
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Where a connection currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHead,
    AccumulatingBody,
    Deciding,
    RejectingLocally,
    ForwardingUpstream,
    RelayingResponse,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::AwaitingHead => "awaiting_head",
            ConnectionState::AccumulatingBody => "accumulating_body",
            ConnectionState::Deciding => "deciding",
            ConnectionState::RejectingLocally => "rejecting_locally",
            ConnectionState::ForwardingUpstream => "forwarding_upstream",
            ConnectionState::RelayingResponse => "relaying_response",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Mutable state for one inbound request. Created when the first byte
/// arrives, dropped when the connection closes; owned by exactly one
/// handler task and never shared.
#[derive(Debug)]
pub struct RequestContext {
    pub peer: SocketAddr,
    pub head: Option<RequestHead>,
    pub body: BytesMut,
    pub state: ConnectionState,
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(peer: SocketAddr) -> Self {
        RequestContext {
            peer,
            head: None,
            body: BytesMut::new(),
            state: ConnectionState::AwaitingHead,
            received_at: Utc::now(),
        }
    }

    /// Raw request target, once the head has been decoded.
    pub fn target(&self) -> Option<&str> {
        self.head.as_ref().map(|head| head.target.as_str())
    }

    /// Milliseconds since the connection was accepted.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.received_at).num_milliseconds()
    }

    pub fn method_text(&self) -> &str {
        self.head
            .as_ref()
            .map(|head| head.method.as_str())
            .unwrap_or("-")
    }
}
