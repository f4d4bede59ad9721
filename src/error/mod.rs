//! Error taxonomy for the proxy engine

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors raised while bringing a listener up. The server never starts
/// when one of these is returned.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("TLS is enabled but no identity is available (cert: {}, key: {})", cert_path.display(), key_path.display())]
    MissingTlsIdentity {
        cert_path: PathBuf,
        key_path: PathBuf,
    },

    #[error("certificate error: {0}")]
    Identity(#[from] CertificateError),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

/// Malformed HTTP framing on a single connection. Never recovered from;
/// the owning connection is closed.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message head: {0}")]
    MalformedHead(#[from] httparse::Error),

    #[error("message head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("unsupported HTTP version 1.{0}")]
    UnsupportedVersion(u8),

    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    #[error("transfer encoding '{0}' is not supported on requests")]
    UnsupportedTransferEncoding(String),

    #[error("stream ended before the message completed")]
    UnexpectedEof,
}

/// Failures reaching or speaking to the origin server. Scoped to one
/// forwarded request; the client sees a synthesized 502.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("connect to {host}:{port} timed out after {seconds}s")]
    ConnectTimeout {
        host: String,
        port: u16,
        seconds: u64,
    },

    #[error("invalid upstream target '{0}'")]
    InvalidTarget(String),

    #[error("TLS handshake with {host} failed: {source}")]
    TlsHandshake {
        host: String,
        source: std::io::Error,
    },

    #[error("upstream protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures issuing, persisting, or reading back the TLS identity.
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("key or certificate generation failed: {0}")]
    Generation(#[from] rcgen::RcgenError),

    #[error("certificate serialization failed: {0}")]
    Serialization(rcgen::RcgenError),

    #[error("failed to persist {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse persisted identity: {0}")]
    Parse(String),

    #[error("no persisted identity (cert: {}, key: {})", cert_path.display(), key_path.display())]
    NotFound {
        cert_path: PathBuf,
        key_path: PathBuf,
    },

    #[error("certificate generation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
