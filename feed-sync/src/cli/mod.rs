//! Command-line interface
//!
//! Provides CLI commands for the feed sync engine.

pub mod audit;
pub mod compact;
pub mod sync;

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sqlx::PgPool;

use crate::config::Settings;
use crate::schema::{DataKind, Interval, LifecycleStatus};
use crate::storage::{self, TargetFilter};

/// Feed sync CLI
#[derive(Parser)]
#[command(name = "feed-sync")]
#[command(about = "Incremental sync of market time series into PostgreSQL")]
#[command(version)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Sync every matching instrument up to the last closed period
    Sync(sync::SyncArgs),
    /// Rebuild one series table keeping the latest row per key
    Compact(compact::CompactArgs),
    /// Report missing periods in persisted series
    Audit(audit::AuditArgs),
}

/// Which series table a command works on
#[derive(Args, Debug, Clone)]
pub struct SeriesArgs {
    /// Data kind (ohlcv, funding-rate, open-interest, spot-ohlcv, index-ohlcv)
    #[arg(long, short)]
    pub kind: DataKind,

    /// Interval (1d, 1h, 1m)
    #[arg(long, short)]
    pub interval: Interval,
}

/// Instrument selection
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Only these exchanges (repeatable or comma-separated)
    #[arg(long = "source", value_delimiter = ',')]
    pub sources: Vec<String>,

    /// Only these instruments (repeatable or comma-separated)
    #[arg(long = "entity", value_delimiter = ',')]
    pub entities: Vec<String>,

    /// Only these lifecycle statuses; defaults to `sync.statuses`
    #[arg(long = "status", value_delimiter = ',')]
    pub statuses: Vec<LifecycleStatus>,
}

impl FilterArgs {
    pub fn to_filter(&self, settings: &Settings) -> TargetFilter {
        TargetFilter {
            sources: self.sources.clone(),
            entities: self.entities.clone(),
            statuses: if self.statuses.is_empty() {
                settings.sync.statuses.clone()
            } else {
                self.statuses.clone()
            },
        }
    }
}

async fn connect(settings: &Settings) -> Result<PgPool> {
    storage::connect(&settings.database)
        .await
        .context("Failed to connect to database")
}

/// Pretty JSON to stdout, or to `path` when given
fn emit_json<T: Serialize>(value: &T, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match path {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}
