//! Settings for the intercepting proxy.
//!
//! Configuration is layered: built-in defaults, then an optional YAML
//! file, then `PROXY_*` environment variables. Later layers win.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::codec::MAX_HEAD_BYTES;
use crate::error::StartupError;
use crate::filter::FilterMode;
use crate::models::LogLevel;

/// Environment variable naming the YAML file to load when no path is
/// given on the command line.
pub const CONFIG_FILE_ENV: &str = "PROXY_CONFIG_FILE";

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Plaintext listener.
    pub listener: ListenerConfig,

    /// TLS interception settings and the TLS listener.
    pub tls: TlsSettings,

    /// URL filtering rule applied to every request.
    pub filter: FilterSettings,

    /// Upstream connection behaviour.
    pub upstream: UpstreamSettings,

    /// Protocol size limits.
    pub limits: LimitSettings,

    /// Minimum level for emitted log events.
    pub log_level: LogLevel,

    /// Log output destination.
    pub logging: LoggingSettings,

    /// Tokio runtime sizing.
    pub runtime: RuntimeSettings,

    /// When false, allowed requests are answered locally instead of
    /// being forwarded upstream. Useful for filter smoke tests.
    pub forwarding_enabled: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            tls: TlsSettings::default(),
            filter: FilterSettings::default(),
            upstream: UpstreamSettings::default(),
            limits: LimitSettings::default(),
            log_level: LogLevel::Info,
            logging: LoggingSettings::default(),
            runtime: RuntimeSettings::default(),
            forwarding_enabled: true,
        }
    }
}

/// One TCP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind host (IP literal).
    pub host: String,

    /// Bind port. Port 0 asks the OS for a free port.
    pub port: u16,

    /// Whether connections on this listener are TLS-terminated.
    pub tls_enabled: bool,

    /// Listen backlog passed to the OS.
    pub backlog: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            tls_enabled: false,
            backlog: 1024,
        }
    }
}

impl ListenerConfig {
    /// Resolves the configured host and port to a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, StartupError> {
        let text = format!("{}:{}", self.host, self.port);
        text.parse().map_err(|_| StartupError::InvalidAddress(text))
    }
}

/// TLS interception settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Whether the TLS listener is started at all.
    pub enabled: bool,

    /// The TLS listener itself.
    pub listener: ListenerConfig,

    /// Path of the PEM-encoded certificate.
    pub cert_path: PathBuf,

    /// Path of the PEM-encoded private key.
    pub key_path: PathBuf,

    /// Issue a fresh identity at startup when none is on disk.
    pub auto_generate: bool,

    /// Subject fields stamped into generated certificates.
    pub subject: SubjectSettings,

    /// Validity window of generated certificates, in days.
    pub validity_days: u32,

    /// Skip verification of upstream server certificates. Only for
    /// test environments with self-signed origins.
    pub skip_upstream_verify: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listener: ListenerConfig {
                host: "127.0.0.1".to_string(),
                port: 8443,
                tls_enabled: true,
                backlog: 1024,
            },
            cert_path: PathBuf::from("certs/proxy-cert.pem"),
            key_path: PathBuf::from("certs/proxy-key.pem"),
            auto_generate: true,
            subject: SubjectSettings::default(),
            validity_days: 365,
            skip_upstream_verify: false,
        }
    }
}

/// Distinguished-name fields for generated certificates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectSettings {
    pub common_name: String,
    pub organization: String,
    pub organizational_unit: String,
    pub country: String,
    pub state_province: String,
    pub locality: String,
}

impl Default for SubjectSettings {
    fn default() -> Self {
        Self {
            common_name: "intercept-proxy.local".to_string(),
            organization: "Intercept Proxy".to_string(),
            organizational_unit: "Proxy Services".to_string(),
            country: "US".to_string(),
            state_province: "California".to_string(),
            locality: "San Francisco".to_string(),
        }
    }
}

/// URL filtering rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Allow-list or block-list interpretation of the patterns.
    pub mode: FilterMode,

    /// Substring patterns matched against the full request URL.
    pub patterns: Vec<String>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        // An empty block list permits everything.
        Self {
            mode: FilterMode::Block,
            patterns: Vec::new(),
        }
    }
}

/// Upstream connection behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// TCP connect timeout, in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
        }
    }
}

/// Protocol size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Maximum accepted size of a request or response head, in bytes.
    pub max_head_bytes: usize,

    /// Maximum accepted size of a request body, in bytes.
    pub max_body_bytes: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_head_bytes: MAX_HEAD_BYTES,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Log output destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Write log lines to daily-rotated files instead of the console.
    pub file_enabled: bool,

    /// Directory for rotated log files.
    pub directory: String,

    /// File name prefix for rotated log files.
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            file_enabled: false,
            directory: "logs".to_string(),
            file_prefix: "intercept-proxy".to_string(),
        }
    }
}

/// Tokio runtime sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Worker thread count. Defaults to the number of cores.
    pub worker_threads: Option<usize>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            worker_threads: None,
        }
    }
}

impl ProxyConfig {
    /// Reads configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Loads configuration with the full layering: defaults, then the
    /// given file (or `PROXY_CONFIG_FILE`), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => match std::env::var(CONFIG_FILE_ENV) {
                Ok(path) => Self::from_yaml_file(&path)?,
                Err(_) => Self::default(),
            },
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies `PROXY_*` environment variables on top of the current
    /// values. Unparsable values are errors, not silent fallbacks.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("PROXY_LISTEN_ADDR") {
            let addr: SocketAddr = value
                .parse()
                .with_context(|| format!("invalid PROXY_LISTEN_ADDR: {value}"))?;
            self.listener.host = addr.ip().to_string();
            self.listener.port = addr.port();
        }

        if let Ok(value) = std::env::var("PROXY_TLS_LISTEN_ADDR") {
            let addr: SocketAddr = value
                .parse()
                .with_context(|| format!("invalid PROXY_TLS_LISTEN_ADDR: {value}"))?;
            self.tls.listener.host = addr.ip().to_string();
            self.tls.listener.port = addr.port();
        }

        if let Ok(value) = std::env::var("PROXY_TLS_ENABLED") {
            self.tls.enabled = value
                .parse()
                .with_context(|| format!("invalid PROXY_TLS_ENABLED: {value}"))?;
        }

        if let Ok(value) = std::env::var("PROXY_CERT_PATH") {
            self.tls.cert_path = PathBuf::from(value);
        }

        if let Ok(value) = std::env::var("PROXY_KEY_PATH") {
            self.tls.key_path = PathBuf::from(value);
        }

        if let Ok(value) = std::env::var("PROXY_FILTER_MODE") {
            self.filter.mode = value
                .parse()
                .with_context(|| format!("invalid PROXY_FILTER_MODE: {value}"))?;
        }

        if let Ok(value) = std::env::var("PROXY_FILTER_PATTERNS") {
            self.filter.patterns = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(value) = std::env::var("PROXY_LOG_LEVEL") {
            self.log_level = value
                .parse()
                .with_context(|| format!("invalid PROXY_LOG_LEVEL: {value}"))?;
        }

        if let Ok(value) = std::env::var("PROXY_CONNECT_TIMEOUT_SECS") {
            self.upstream.connect_timeout_secs = value
                .parse()
                .with_context(|| format!("invalid PROXY_CONNECT_TIMEOUT_SECS: {value}"))?;
        }

        if let Ok(value) = std::env::var("PROXY_MAX_BODY_BYTES") {
            self.limits.max_body_bytes = value
                .parse()
                .with_context(|| format!("invalid PROXY_MAX_BODY_BYTES: {value}"))?;
        }

        if let Ok(value) = std::env::var("PROXY_WORKER_THREADS") {
            self.runtime.worker_threads = Some(
                value
                    .parse()
                    .with_context(|| format!("invalid PROXY_WORKER_THREADS: {value}"))?,
            );
        }

        if let Ok(value) = std::env::var("PROXY_FORWARDING_ENABLED") {
            self.forwarding_enabled = value
                .parse()
                .with_context(|| format!("invalid PROXY_FORWARDING_ENABLED: {value}"))?;
        }

        if let Ok(value) = std::env::var("PROXY_SKIP_UPSTREAM_VERIFY") {
            self.tls.skip_upstream_verify = value
                .parse()
                .with_context(|| format!("invalid PROXY_SKIP_UPSTREAM_VERIFY: {value}"))?;
        }

        Ok(())
    }
}
