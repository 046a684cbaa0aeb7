//! Feed Sync CLI
//!
//! Provides commands for:
//! - `sync`: Bring matching series up to the last closed period
//! - `compact`: Deduplicate one series table
//! - `audit`: Report missing periods in persisted series

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use feed_common::logging::{init_logging, LogConfig};
use feed_sync::cli::{Cli, Commands};
use feed_sync::config::Settings;
use feed_sync::sync::ExitStatus;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    if let Err(e) = init_logging(LogConfig::from_env().with_default_level("feed_sync=info")) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitStatus::Failure.into();
    }

    // Parse CLI arguments
    let cli = Cli::parse();

    match run(cli).await {
        Ok(status) => status.into(),
        Err(e) => {
            error!("{:#}", e);
            ExitStatus::Failure.into()
        }
    }
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let settings = Settings::load()?;
    settings.validate()?;

    match cli.command {
        Commands::Sync(args) => feed_sync::cli::sync::execute(args, &settings).await,
        Commands::Compact(args) => feed_sync::cli::compact::execute(args, &settings).await,
        Commands::Audit(args) => feed_sync::cli::audit::execute(args, &settings).await,
    }
}
