//! Compact command - maintenance-mode deduplication of one series table
//!
//! Must not overlap a sync run writing the same table.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::info;

use super::{connect, emit_json, SeriesArgs};
use crate::config::Settings;
use crate::schema::{TableName, COLLECTED_AT_COLUMN, KEY_COLUMNS};
use crate::storage::{CompactionStats, PersistenceGateway, PgGateway};
use crate::sync::ExitStatus;

/// Arguments for the compact command
#[derive(Args, Debug)]
pub struct CompactArgs {
    #[command(flatten)]
    pub series: SeriesArgs,
}

#[derive(Debug, Serialize)]
struct CompactReport {
    table: TableName,
    #[serde(flatten)]
    stats: CompactionStats,
    removed: u64,
}

/// Execute the compact command
pub async fn execute(args: CompactArgs, settings: &Settings) -> Result<ExitStatus> {
    let pool = connect(settings).await?;
    let gateway = PgGateway::new(pool, settings.database.schema_name(), settings.database.retry.policy());
    let table = gateway.table_for(args.series.kind, args.series.interval)?;

    info!(table = %table, "Compacting");
    let stats = gateway
        .compact(&table, &KEY_COLUMNS, COLLECTED_AT_COLUMN)
        .await
        .with_context(|| format!("Failed to compact {}", table))?;

    emit_json(
        &CompactReport {
            removed: stats.removed(),
            table,
            stats,
        },
        None,
    )?;
    Ok(ExitStatus::Success)
}
