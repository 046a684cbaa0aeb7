//! Gap audit over persisted series
//!
//! The sync loop advances past windows that came back without usable records,
//! so a provider hiccup can leave holes behind the watermark. The audit walks
//! the expected period starts of a lookback range and reports every missing
//! run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::schema::{Interval, SyncTarget, WatermarkKey};
use crate::storage::{GatewayResult, PersistenceGateway};
use crate::window::WindowCalculator;

/// A run of consecutive missing periods
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataGap {
    pub key: WatermarkKey,
    /// First missing period (inclusive)
    pub start: DateTime<Utc>,
    /// First period present again, or one past the audit range (exclusive)
    pub end: DateTime<Utc>,
    pub missing_periods: i64,
}

/// Missing runs of period starts in `[start, end]`
///
/// `timestamps` must be ascending; values off the period grid or outside the
/// range are ignored. Returns `(gap_start, gap_end_exclusive, missing)`.
pub fn detect_gaps(
    timestamps: &[DateTime<Utc>],
    interval: Interval,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>, i64)> {
    let start = interval.floor(start);
    let end = interval.floor(end);
    if start > end {
        return Vec::new();
    }

    let mut gaps = Vec::new();
    let mut expected = start;

    for &ts in timestamps {
        if ts < expected || ts > end || interval.floor(ts) != ts {
            continue;
        }
        if ts > expected {
            gaps.push((expected, ts, interval.periods_between(expected, ts)));
        }
        expected = interval.advance(ts, 1);
    }

    if expected <= end {
        let stop = interval.advance(end, 1);
        gaps.push((expected, stop, interval.periods_between(expected, stop)));
    }

    gaps
}

/// Audit one target over the last `lookback_periods` closed periods
///
/// The range never starts before the target's first known activity and
/// never ends past its effective end.
pub async fn audit_target<S: PersistenceGateway + ?Sized>(
    gateway: &S,
    windows: &WindowCalculator,
    target: &SyncTarget,
    lookback_periods: u32,
    now: DateTime<Utc>,
) -> GatewayResult<Vec<DataGap>> {
    let interval = target.interval;
    let end = windows.effective_end(target, now);
    let mut start = interval.advance(end, -(i64::from(lookback_periods.max(1)) - 1));
    if let Some(first) = target.first_available_at {
        start = start.max(interval.floor(first));
    }
    if start > end {
        return Ok(Vec::new());
    }

    let key = target.key();
    let timestamps = gateway.series_timestamps(&key, start, end).await?;
    debug!(target = %key, start = %start, end = %end, present = timestamps.len(), "Auditing series");

    Ok(detect_gaps(&timestamps, interval, start, end)
        .into_iter()
        .map(|(start, end, missing_periods)| DataGap {
            key: key.clone(),
            start,
            end,
            missing_periods,
        })
        .collect())
}
