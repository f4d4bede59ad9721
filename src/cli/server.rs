//! Serve command: flag handling and listener startup.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

use crate::config::ProxyConfig;
use crate::filter::FilterMode;
use crate::models::LogLevel;
use crate::proxy::ProxyServer;

#[derive(Debug, Default, Args)]
pub struct ServeArgs {
    /// Configuration file path (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Plaintext listener address, host:port
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// TLS listener address, host:port
    #[arg(long)]
    pub tls_listen_addr: Option<String>,

    /// Start the TLS interception listener
    #[arg(long, conflicts_with = "no_tls")]
    pub tls: bool,

    /// Leave the TLS listener off even when the config enables it
    #[arg(long)]
    pub no_tls: bool,

    /// Filter mode: allow or block
    #[arg(long)]
    pub filter_mode: Option<String>,

    /// Comma-separated filter patterns
    #[arg(long)]
    pub filter_patterns: Option<String>,

    /// Certificate file path
    #[arg(long)]
    pub cert_path: Option<PathBuf>,

    /// Private key file path
    #[arg(long)]
    pub key_path: Option<PathBuf>,

    /// Issue a fresh identity at startup when none is on disk
    #[arg(long)]
    pub auto_generate_cert: bool,

    /// Skip upstream certificate verification (insecure)
    #[arg(long)]
    pub skip_cert_verify: bool,

    /// Answer allowed requests locally instead of forwarding upstream
    #[arg(long)]
    pub no_forward: bool,

    /// Upstream connect timeout in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Log level: debug, info, warning, error
    #[arg(long)]
    pub log_level: Option<String>,
}

impl ServeArgs {
    /// Loads the layered configuration and applies the flags on top.
    /// Flags always win over the file and the environment.
    pub fn resolved_config(&self) -> Result<ProxyConfig> {
        self.apply_overrides(ProxyConfig::load(self.config.as_deref())?)
    }

    fn apply_overrides(&self, mut config: ProxyConfig) -> Result<ProxyConfig> {
        if let Some(addr) = &self.listen_addr {
            let parsed: SocketAddr = addr
                .parse()
                .map_err(|_| anyhow!("invalid listen address '{addr}'"))?;
            config.listener.host = parsed.ip().to_string();
            config.listener.port = parsed.port();
        }
        if let Some(addr) = &self.tls_listen_addr {
            let parsed: SocketAddr = addr
                .parse()
                .map_err(|_| anyhow!("invalid TLS listen address '{addr}'"))?;
            config.tls.listener.host = parsed.ip().to_string();
            config.tls.listener.port = parsed.port();
        }
        if self.tls {
            config.tls.enabled = true;
        }
        if self.no_tls {
            config.tls.enabled = false;
        }
        if let Some(mode) = &self.filter_mode {
            config.filter.mode = mode.parse::<FilterMode>()?;
        }
        if let Some(patterns) = &self.filter_patterns {
            config.filter.patterns = patterns
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(path) = &self.cert_path {
            config.tls.cert_path = path.clone();
        }
        if let Some(path) = &self.key_path {
            config.tls.key_path = path.clone();
        }
        if self.auto_generate_cert {
            config.tls.auto_generate = true;
        }
        if self.skip_cert_verify {
            config.tls.skip_upstream_verify = true;
        }
        if self.no_forward {
            config.forwarding_enabled = false;
        }
        if let Some(secs) = self.connect_timeout {
            config.upstream.connect_timeout_secs = secs;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.parse::<LogLevel>()?;
        }

        Ok(config)
    }

    /// Brings the listeners up and serves until interrupted.
    pub async fn run(&self, config: ProxyConfig) -> Result<()> {
        info!("📋 Configuration:");
        info!(
            "   Plaintext listener: {}:{}",
            config.listener.host, config.listener.port
        );
        if config.tls.enabled {
            info!(
                "   TLS listener: {}:{}",
                config.tls.listener.host, config.tls.listener.port
            );
            info!("   Certificate: {}", config.tls.cert_path.display());
            info!(
                "   Auto-generate identity: {}",
                if config.tls.auto_generate { "yes" } else { "no" }
            );
        } else {
            info!("   TLS listener: disabled");
        }
        info!(
            "   Filter: {} mode, {} pattern(s)",
            config.filter.mode,
            config.filter.patterns.len()
        );
        info!(
            "   Forwarding: {}",
            if config.forwarding_enabled {
                "upstream"
            } else {
                "local responder"
            }
        );

        let server = ProxyServer::new(config.clone());
        let mut handles = Vec::new();
        handles.push(server.start().await.context("plaintext listener failed")?);
        if config.tls.enabled {
            handles.push(server.start_tls().await.context("TLS listener failed")?);
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("👋 Shutting down");
        for handle in &mut handles {
            handle.stop().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_args() -> ServeArgs {
        ServeArgs::default()
    }

    #[test]
    fn flags_override_the_loaded_config() {
        let mut args = bare_args();
        args.listen_addr = Some("0.0.0.0:9000".to_string());
        args.filter_mode = Some("allow".to_string());
        args.filter_patterns = Some("example.com, internal ,".to_string());
        args.no_forward = true;
        args.no_tls = true;

        let config = args.apply_overrides(ProxyConfig::default()).unwrap();
        assert_eq!(config.listener.host, "0.0.0.0");
        assert_eq!(config.listener.port, 9000);
        assert_eq!(config.filter.mode, FilterMode::Allow);
        assert_eq!(
            config.filter.patterns,
            vec!["example.com".to_string(), "internal".to_string()]
        );
        assert!(!config.forwarding_enabled);
        assert!(!config.tls.enabled);
    }

    #[test]
    fn bad_flag_values_are_rejected() {
        let mut args = bare_args();
        args.listen_addr = Some("not-an-address".to_string());
        assert!(args.apply_overrides(ProxyConfig::default()).is_err());

        let mut args = bare_args();
        args.filter_mode = Some("deny".to_string());
        assert!(args.apply_overrides(ProxyConfig::default()).is_err());

        let mut args = bare_args();
        args.log_level = Some("loud".to_string());
        assert!(args.apply_overrides(ProxyConfig::default()).is_err());
    }
}
