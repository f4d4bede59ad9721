//! Tracing initialization and the structured event sink.

pub mod sink;

pub use sink::{CollectingSink, LogSink, NullSink, TracingSink};

use std::sync::Once;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::LoggingSettings;
use crate::models::LogLevel;

static INIT: Once = Once::new();

fn directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warn",
        LogLevel::Error => "error",
    }
}

/// Initializes the global subscriber once. `RUST_LOG` wins over the
/// configured level when set. Returns the appender guard when file logging
/// is enabled; the caller must keep it alive for the process lifetime.
pub fn init_logging(level: LogLevel, settings: &LoggingSettings) -> Option<WorkerGuard> {
    let mut guard = None;
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(directive(level)));

        if settings.file_enabled {
            let appender =
                tracing_appender::rolling::daily(&settings.directory, &settings.file_prefix);
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            guard = Some(worker_guard);
        } else {
            FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .init();
        }

        // Bridge log-crate events (rustls and friends) into tracing
        if let Err(e) = LogTracer::init() {
            eprintln!("Warning: failed to initialize log bridge: {:?}", e);
        }
    });
    guard
}
