//! Intercept Proxy - a filtering forward proxy that terminates TLS.
//!
//! The proxy accepts plaintext and TLS connections, reads one HTTP/1.1
//! request per connection, decides allow-or-block from a substring filter,
//! and either answers locally or forwards to the upstream origin. The TLS
//! listener serves a self-issued identity so intercepted traffic can be
//! inspected in the clear.

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod tls;
pub mod utils;

// Re-export commonly used items
pub use config::ProxyConfig;
pub use error::{CertificateError, ProtocolError, StartupError, UpstreamError};
pub use filter::{FilterEngine, FilterMode, FilterRule};
pub use logging::{init_logging, CollectingSink, LogSink, NullSink, TracingSink};
pub use models::{Direction, LogEvent, LogLevel};
pub use proxy::{Forwarder, ProxyServer, ServerHandle};
pub use tls::CertificateAuthority;

/// Tokio runtime construction sized from configuration.
pub mod runtime {
    use anyhow::{Context, Result};
    use tokio::runtime::{Builder, Runtime};
    use tracing::info;

    /// Builds the multi-threaded runtime. A configured worker count wins;
    /// otherwise sizing is left to the detected CPU count.
    pub fn create_runtime(worker_threads: Option<usize>) -> Result<Runtime> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all();
        match worker_threads {
            Some(threads) if threads > 0 => {
                info!("🧵 Runtime with {} worker threads", threads);
                builder.worker_threads(threads);
            }
            _ => info!("🧵 Runtime with auto-detected worker threads"),
        }
        builder.build().context("failed to create Tokio runtime")
    }
}
