//! SRPC binary.
//!
//! Runs a demonstration server or queries existing SRPC servers.

use clap::Parser;
use srpc::{
    cli::commands::{Commands, LoggingArgs},
    cli::handlers::{handle_call, handle_hostname, handle_methods, handle_ping, handle_serve},
    config::Settings,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "SRPC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let level = cli
        .logging
        .log_level
        .clone()
        .unwrap_or_else(|| settings.logging.level.clone());
    let filter = cli
        .logging
        .log_filter
        .clone()
        .or_else(|| settings.logging.filter.clone());

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.parse().unwrap_or(LevelFilter::INFO).into())
                .parse_lossy(filter.as_deref().unwrap_or("")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    debug!(?settings, "configuration loaded");

    match cli.command {
        Commands::Serve(cmd) => handle_serve(cmd, settings).await?,
        Commands::Ping(target) => handle_ping(target, settings).await?,
        Commands::Methods(cmd) => handle_methods(cmd, settings).await?,
        Commands::Hostname(target) => handle_hostname(target, settings).await?,
        Commands::Call(cmd) => handle_call(cmd, settings).await?,
    }

    Ok(())
}
