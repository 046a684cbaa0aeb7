//! Fetch window calculation
//!
//! Decides, for one target, which periods still need fetching given the
//! persisted watermark and the target's lifecycle. No I/O: `now` is injected.

use chrono::{DateTime, Utc};

use crate::config::PageLimits;
use crate::schema::{DataKind, FetchWindow, Interval, SyncTarget};

/// Computes the next [`FetchWindow`] for a target
#[derive(Debug, Clone)]
pub struct WindowCalculator {
    limits: PageLimits,
    /// Cold-start horizon in periods; defaults to the page limit
    max_backfill_periods: Option<u32>,
}

impl WindowCalculator {
    pub fn new(limits: PageLimits, max_backfill_periods: Option<u32>) -> Self {
        Self {
            limits,
            max_backfill_periods,
        }
    }

    /// Largest number of periods the provider serves in one call
    pub fn max_limit_for(&self, kind: DataKind, interval: Interval) -> u32 {
        self.limits.limit_for(kind, interval).max(1)
    }

    fn backfill_periods(&self, kind: DataKind, interval: Interval) -> u32 {
        self.max_backfill_periods
            .unwrap_or_else(|| self.max_limit_for(kind, interval))
    }

    /// Upper bound for any window of this target at `now`
    ///
    /// Active targets run up to the last closed period. Inactive targets also
    /// stop at their last known activity; without one they fall back to the
    /// last closed period.
    pub fn effective_end(&self, target: &SyncTarget, now: DateTime<Utc>) -> DateTime<Utc> {
        let closed = target.interval.last_closed(now);
        if target.lifecycle_status.is_active() {
            return closed;
        }
        match target.last_activity_at {
            Some(last) => last.min(closed),
            None => closed,
        }
    }

    /// First period to request when resuming from `watermark`
    pub fn start_for(
        &self,
        target: &SyncTarget,
        watermark: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let interval = target.interval;
        match (watermark, target.first_available_at) {
            (Some(watermark), _) => interval.advance(watermark, 1),
            (None, Some(first)) => first,
            (None, None) => {
                let horizon = i64::from(self.backfill_periods(target.kind, interval));
                interval.floor(interval.advance(now, -horizon))
            }
        }
    }

    /// Next window to fetch, or `None` when the target is up to date
    pub fn compute_window(
        &self,
        target: &SyncTarget,
        watermark: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<FetchWindow> {
        let interval = target.interval;
        let start = self.start_for(target, watermark, now);
        let effective_end = self.effective_end(target, now);

        if start > effective_end {
            return None;
        }

        let max_limit = i64::from(self.max_limit_for(target.kind, interval));
        let limit = (interval.periods_between(start, effective_end) + 1).clamp(1, max_limit);
        let end = interval.advance(start, limit - 1).min(effective_end);

        Some(FetchWindow {
            start,
            end,
            limit: limit as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LifecycleStatus;
    use chrono::{Duration, TimeZone};

    fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn calculator() -> WindowCalculator {
        WindowCalculator::new(PageLimits::default(), None)
    }

    fn target(interval: Interval, status: LifecycleStatus) -> SyncTarget {
        SyncTarget::new(
            "binance",
            "BTC-USDT-VANILLA-PERPETUAL",
            DataKind::Ohlcv,
            interval,
            status,
        )
    }

    #[test]
    fn test_resume_from_watermark_then_up_to_date() {
        let calc = calculator();
        let target = target(Interval::Day, LifecycleStatus::Active);
        let now = ts(2024, 1, 10, 0);

        let window = calc.compute_window(&target, Some(ts(2024, 1, 5, 0)), now).unwrap();
        assert_eq!(window.start, ts(2024, 1, 6, 0));
        assert_eq!(window.end, ts(2024, 1, 9, 0));
        assert_eq!(window.limit, 4);

        assert_eq!(calc.compute_window(&target, Some(window.end), now), None);
    }

    #[test]
    fn test_cold_start_uses_first_available() {
        let calc = calculator();
        let first = ts(2023, 3, 15, 8);
        let target = target(Interval::Hour, LifecycleStatus::Active).with_first_available_at(first);

        let window = calc.compute_window(&target, None, ts(2024, 1, 10, 0)).unwrap();
        assert_eq!(window.start, first);
        assert_eq!(window.limit, 2000);
        assert_eq!(window.end, first + Duration::hours(1999));
    }

    #[test]
    fn test_cold_start_without_first_available_uses_floored_horizon() {
        let calc = WindowCalculator::new(PageLimits::default(), Some(10));
        let target = target(Interval::Day, LifecycleStatus::Active);

        let window = calc.compute_window(&target, None, ts(2024, 1, 10, 15)).unwrap();
        assert_eq!(window.start, ts(2023, 12, 31, 0));
        assert_eq!(window.end, ts(2024, 1, 9, 0));
        assert_eq!(window.limit, 10);
    }

    #[test]
    fn test_default_backfill_horizon_is_page_limit() {
        let calc = calculator();
        let target = target(Interval::Minute, LifecycleStatus::Active);
        let now = ts(2024, 1, 10, 0);

        let window = calc.compute_window(&target, None, now).unwrap();
        assert_eq!(window.start, now - Duration::minutes(2000));
        assert_eq!(window.limit, 2000);
    }

    #[test]
    fn test_retired_target_never_passes_last_activity() {
        let calc = calculator();
        let last = ts(2023, 6, 30, 8);
        let target = target(Interval::Day, LifecycleStatus::Retired).with_last_activity_at(last);

        for now in [ts(2023, 7, 1, 0), ts(2024, 1, 10, 0), ts(2030, 1, 1, 0)] {
            let mut watermark = Some(ts(2023, 1, 1, 0));
            while let Some(window) = calc.compute_window(&target, watermark, now) {
                assert!(window.end <= last, "window {:?} passes {}", window, last);
                watermark = Some(window.end);
            }
        }
    }

    #[test]
    fn test_inactive_without_last_activity_clamps_to_now() {
        let calc = calculator();
        let target = target(Interval::Day, LifecycleStatus::Expired);
        let now = ts(2024, 1, 10, 0);

        assert_eq!(calc.effective_end(&target, now), ts(2024, 1, 9, 0));
    }

    #[test]
    fn test_active_ignores_last_activity() {
        let calc = calculator();
        let target = target(Interval::Day, LifecycleStatus::Active)
            .with_last_activity_at(ts(2023, 6, 30, 0));
        let now = ts(2024, 1, 10, 0);

        assert_eq!(calc.effective_end(&target, now), ts(2024, 1, 9, 0));
    }

    #[test]
    fn test_watermark_in_current_period_is_up_to_date() {
        let calc = calculator();
        let target = target(Interval::Hour, LifecycleStatus::Active);
        let now = ts(2024, 1, 10, 12) + Duration::minutes(30);

        assert_eq!(calc.compute_window(&target, Some(ts(2024, 1, 10, 11)), now), None);
        let window = calc.compute_window(&target, Some(ts(2024, 1, 10, 10)), now).unwrap();
        assert_eq!((window.start, window.end, window.limit), (ts(2024, 1, 10, 11), ts(2024, 1, 10, 11), 1));
    }

    #[test]
    fn test_windows_are_monotonic_and_bounded() {
        let calc = calculator();
        let now = ts(2024, 1, 10, 7);

        for interval in Interval::ALL {
            for kind in DataKind::ALL {
                let mut target = target(interval, LifecycleStatus::Active)
                    .with_first_available_at(ts(2023, 11, 1, 0));
                target.kind = kind;

                let max = calc.max_limit_for(kind, interval);
                let mut watermark: Option<DateTime<Utc>> = None;
                let mut previous_start: Option<DateTime<Utc>> = None;
                let mut iterations = 0;

                while let Some(window) = calc.compute_window(&target, watermark, now) {
                    assert!(window.limit >= 1 && window.limit <= max);
                    assert!(window.start <= window.end);
                    if let Some(w) = watermark {
                        assert!(window.start > w);
                    }
                    if let Some(p) = previous_start {
                        assert!(window.start > p);
                    }
                    previous_start = Some(window.start);
                    watermark = Some(window.end);
                    iterations += 1;
                    assert!(iterations < 1_000, "no convergence for {} {}", kind, interval);
                }

                assert_eq!(watermark, Some(interval.last_closed(now)));
            }
        }
    }
}
