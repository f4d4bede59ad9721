//! Main entry point for the intercept proxy.

use clap::{Parser, Subcommand};
use intercept_proxy::cli::{CertCommand, ServeArgs};
use intercept_proxy::config::LoggingSettings;
use intercept_proxy::runtime::create_runtime;
use intercept_proxy::{init_logging, LogLevel};

#[derive(Parser)]
#[command(name = "intercept-proxy")]
#[command(about = "A filtering forward proxy that terminates TLS")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proxy listeners
    Serve(ServeArgs),

    /// Certificate management
    #[command(subcommand)]
    Cert(CertCommand),
}

fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Some(Command::Serve(args)) => serve(args),
        // No subcommand starts the proxy with defaults
        None => serve(ServeArgs::default()),
        Some(Command::Cert(command)) => {
            let _guard = init_logging(LogLevel::Info, &LoggingSettings::default());
            let runtime = create_runtime(None)?;
            runtime.block_on(command.execute())
        }
    }
}

fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.resolved_config()?;
    let _guard = init_logging(config.log_level, &config.logging);
    let runtime = create_runtime(config.runtime.worker_threads)?;
    runtime.block_on(args.run(config))
}
