//! Sync command - bring matching series up to the last closed period

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{connect, emit_json, FilterArgs, SeriesArgs};
use crate::config::Settings;
use crate::provider::ccdata::CcdataProvider;
use crate::schema::{DataKind, Interval, COLLECTED_AT_COLUMN, KEY_COLUMNS};
use crate::storage::{InstrumentCatalog, PersistenceGateway, PgGateway, PgInstrumentCatalog};
use crate::sync::{ExitStatus, OrchestratorConfig, PaginatingSyncer, RunSummary, SyncOrchestrator};
use crate::window::WindowCalculator;

/// Arguments for the sync command
#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub series: SeriesArgs,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Targets synced concurrently; defaults to `sync.parallel_workers`
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Stop scheduling after the first failed target
    #[arg(long)]
    pub stop_on_error: bool,

    /// Cancel the run after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Compact the series table once the run completes
    #[arg(long)]
    pub compact: bool,

    /// Write the JSON summary here instead of stdout
    #[arg(long)]
    pub summary: Option<PathBuf>,
}

/// Execute the sync command
pub async fn execute(args: SyncArgs, settings: &Settings) -> Result<ExitStatus> {
    let SeriesArgs { kind, interval } = args.series;

    let pool = connect(settings).await?;
    let schema = settings.database.schema_name();

    let catalog = PgInstrumentCatalog::new(pool.clone(), schema, settings.database.instruments_table_for(kind))?;
    let targets = catalog
        .list_targets(&args.filter.to_filter(settings), kind, interval)
        .await
        .context("Failed to list sync targets")?;

    let provider = CcdataProvider::from_settings(&settings.provider)?;
    let gateway = PgGateway::new(pool, schema, settings.database.retry.policy());
    let windows = WindowCalculator::new(
        settings.sync.page_limits.clone(),
        settings.sync.max_backfill_periods,
    );
    let syncer = PaginatingSyncer::new(Arc::new(provider), Arc::new(gateway), windows);

    let mut config = OrchestratorConfig::from(&settings.sync);
    if args.stop_on_error {
        config.continue_on_error = false;
    }
    let orchestrator = SyncOrchestrator::new(syncer, config);
    let parallel = args.parallel.unwrap_or(settings.sync.parallel_workers);

    info!(kind = %kind, interval = %interval, targets = targets.len(), parallel, "Sync starting");

    let cancel = CancellationToken::new();
    let watcher = spawn_cancel_watcher(cancel.clone(), args.timeout_secs.map(Duration::from_secs));
    let mut summary = orchestrator.run(targets, parallel, &cancel).await;
    watcher.abort();

    if args.compact {
        compact_after_run(orchestrator.syncer().gateway().as_ref(), kind, interval, &mut summary).await;
    }

    emit_json(&summary, args.summary.as_deref())?;
    Ok(summary.exit_status())
}

/// Compact the synced series table, recording the result on `summary`
///
/// Failures are logged and reported in the summary, never returned.
async fn compact_after_run<G: PersistenceGateway + ?Sized>(
    gateway: &G,
    kind: DataKind,
    interval: Interval,
    summary: &mut RunSummary,
) {
    if summary.cancelled {
        warn!("Run was cancelled, skipping compaction");
        return;
    }

    let table = match gateway.table_for(kind, interval) {
        Ok(table) => table,
        Err(e) => {
            error!(kind = %kind, interval = %interval, "Compaction failed: {}", e);
            summary.compaction_error = Some(e.to_string());
            return;
        }
    };

    match gateway.compact(&table, &KEY_COLUMNS, COLLECTED_AT_COLUMN).await {
        Ok(stats) => {
            info!(table = %table, rows_before = stats.rows_before, removed = stats.removed(), "Compacted series table");
            summary.compaction = Some(stats);
        }
        Err(e) => {
            error!(table = %table, "Compaction failed: {}", e);
            summary.compaction_error = Some(format!("Failed to compact {}: {}", table, e));
        }
    }
}

/// Cancel `cancel` on Ctrl-C or once `timeout` elapses
fn spawn_cancel_watcher(cancel: CancellationToken, timeout: Option<Duration>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
                warn!("Interrupt received, cancelling run");
            }
            _ = deadline => warn!(timeout_secs = timeout.map(|t| t.as_secs()), "Run timed out, cancelling"),
        }
        cancel.cancel();
    })
}
