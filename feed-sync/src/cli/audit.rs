//! Audit command - report missing periods behind the watermark

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use serde::Serialize;
use tracing::{info, warn};

use super::{connect, emit_json, FilterArgs, SeriesArgs};
use crate::config::Settings;
use crate::storage::{InstrumentCatalog, PgGateway, PgInstrumentCatalog};
use crate::sync::{audit_target, DataGap, ExitStatus};
use crate::window::WindowCalculator;

/// Arguments for the audit command
#[derive(Args, Debug)]
pub struct AuditArgs {
    #[command(flatten)]
    pub series: SeriesArgs,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Closed periods to look back from the effective end of each target
    #[arg(long, default_value_t = 30)]
    pub lookback_periods: u32,
}

#[derive(Debug, Serialize)]
struct AuditReport {
    targets_audited: usize,
    targets_with_gaps: usize,
    missing_periods: i64,
    gaps: Vec<DataGap>,
}

/// Execute the audit command
///
/// Exits with partial failure when any gap is found.
pub async fn execute(args: AuditArgs, settings: &Settings) -> Result<ExitStatus> {
    let SeriesArgs { kind, interval } = args.series;

    let pool = connect(settings).await?;
    let schema = settings.database.schema_name();
    let catalog = PgInstrumentCatalog::new(pool.clone(), schema, settings.database.instruments_table_for(kind))?;
    let targets = catalog
        .list_targets(&args.filter.to_filter(settings), kind, interval)
        .await
        .context("Failed to list audit targets")?;

    let gateway = PgGateway::new(pool, schema, settings.database.retry.policy());
    let windows = WindowCalculator::new(
        settings.sync.page_limits.clone(),
        settings.sync.max_backfill_periods,
    );
    let now = Utc::now();

    let mut report = AuditReport {
        targets_audited: 0,
        targets_with_gaps: 0,
        missing_periods: 0,
        gaps: Vec::new(),
    };

    for target in &targets {
        let gaps = audit_target(&gateway, &windows, target, args.lookback_periods, now)
            .await
            .with_context(|| format!("Failed to audit {}", target.key()))?;

        report.targets_audited += 1;
        if !gaps.is_empty() {
            report.targets_with_gaps += 1;
            let missing: i64 = gaps.iter().map(|g| g.missing_periods).sum();
            report.missing_periods += missing;
            warn!(target = %target.key(), gaps = gaps.len(), missing, "Gaps found");
        }
        report.gaps.extend(gaps);
    }

    info!(
        targets = report.targets_audited,
        with_gaps = report.targets_with_gaps,
        missing_periods = report.missing_periods,
        "Audit complete"
    );

    let status = if report.gaps.is_empty() {
        ExitStatus::Success
    } else {
        ExitStatus::PartialFailure
    };
    emit_json(&report, None)?;
    Ok(status)
}
