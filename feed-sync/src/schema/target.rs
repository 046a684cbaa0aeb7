//! Sync target identity, intervals, data kinds and fetch windows

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::SchemaError;

/// Bar interval of a time series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1d")]
    Day,
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "1m")]
    Minute,
}

impl Interval {
    pub const ALL: [Interval; 3] = [Interval::Day, Interval::Hour, Interval::Minute];

    /// Short suffix used in table names ("1d", "1h", "1m")
    pub fn as_suffix(&self) -> &'static str {
        match self {
            Interval::Day => "1d",
            Interval::Hour => "1h",
            Interval::Minute => "1m",
        }
    }

    /// Length of one period in seconds
    pub fn seconds(&self) -> i64 {
        match self {
            Interval::Day => 86_400,
            Interval::Hour => 3_600,
            Interval::Minute => 60,
        }
    }

    /// Length of one period
    pub fn period(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Start of the period containing `ts`
    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let epoch = ts.timestamp();
        let floored = epoch - epoch.rem_euclid(self.seconds());
        DateTime::from_timestamp(floored, 0).unwrap_or(ts)
    }

    /// Start of the last period that has fully closed at `now`
    ///
    /// At 2024-01-10T00:00 the daily bar for 2024-01-10 has only just opened,
    /// so the last closed bar is 2024-01-09.
    pub fn last_closed(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.floor(now) - self.period()
    }

    /// Whole periods from `start` to `end`, both floored to period starts
    pub fn periods_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        let delta = self.floor(end).timestamp() - self.floor(start).timestamp();
        delta.div_euclid(self.seconds())
    }

    /// Move `ts` forward by `periods` periods
    pub fn advance(&self, ts: DateTime<Utc>, periods: i64) -> DateTime<Utc> {
        ts + Duration::seconds(self.seconds() * periods)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_suffix())
    }
}

impl FromStr for Interval {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1d" | "d" | "day" | "days" => Ok(Interval::Day),
            "1h" | "h" | "hour" | "hours" => Ok(Interval::Hour),
            "1m" | "m" | "minute" | "minutes" => Ok(Interval::Minute),
            _ => Err(SchemaError::unknown("interval", s)),
        }
    }
}

/// Kind of time series being synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataKind {
    /// Futures trade candles
    Ohlcv,
    FundingRate,
    OpenInterest,
    /// Spot trade candles for one exchange pair
    SpotOhlcv,
    /// Index family candles, e.g. `cadli` BTC-USD
    IndexOhlcv,
}

/// Market segment a kind belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Futures,
    Spot,
    Index,
}

impl DataKind {
    pub const ALL: [DataKind; 5] = [
        DataKind::Ohlcv,
        DataKind::FundingRate,
        DataKind::OpenInterest,
        DataKind::SpotOhlcv,
        DataKind::IndexOhlcv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Ohlcv => "ohlcv",
            DataKind::FundingRate => "funding-rate",
            DataKind::OpenInterest => "open-interest",
            DataKind::SpotOhlcv => "spot-ohlcv",
            DataKind::IndexOhlcv => "index-ohlcv",
        }
    }

    pub fn market(&self) -> Market {
        match self {
            DataKind::Ohlcv | DataKind::FundingRate | DataKind::OpenInterest => Market::Futures,
            DataKind::SpotOhlcv => Market::Spot,
            DataKind::IndexOhlcv => Market::Index,
        }
    }

    /// Table name prefix; the interval suffix is appended per series
    pub fn table_base(&self) -> &'static str {
        match self {
            DataKind::Ohlcv => "futures_ohlcv",
            DataKind::FundingRate => "futures_funding_rate_ohlc",
            DataKind::OpenInterest => "futures_open_interest_ohlc",
            DataKind::SpotOhlcv => "spot_ohlcv",
            DataKind::IndexOhlcv => "index_ohlcv",
        }
    }

    /// Instrument catalog column holding the last real update for this kind
    pub fn last_activity_column(&self) -> &'static str {
        match self {
            DataKind::Ohlcv | DataKind::SpotOhlcv => "last_trade_datetime",
            DataKind::FundingRate => "last_funding_rate_update_datetime",
            DataKind::OpenInterest => "last_open_interest_update_datetime",
            DataKind::IndexOhlcv => "last_message_datetime",
        }
    }

    /// Instrument catalog column holding the first known update for this kind
    pub fn first_available_column(&self) -> &'static str {
        match self {
            DataKind::Ohlcv | DataKind::SpotOhlcv => "first_trade_datetime",
            DataKind::FundingRate => "first_funding_rate_update_datetime",
            DataKind::OpenInterest => "first_open_interest_update_datetime",
            DataKind::IndexOhlcv => "first_message_datetime",
        }
    }
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Futures => "futures",
            Market::Spot => "spot",
            Market::Index => "index",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "ohlcv" => Ok(DataKind::Ohlcv),
            "funding-rate" | "fr" => Ok(DataKind::FundingRate),
            "open-interest" | "oi" => Ok(DataKind::OpenInterest),
            "spot-ohlcv" | "spot" => Ok(DataKind::SpotOhlcv),
            "index-ohlcv" | "index" => Ok(DataKind::IndexOhlcv),
            _ => Err(SchemaError::unknown("data kind", s)),
        }
    }
}

/// Trading lifecycle of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Active,
    Expired,
    Retired,
    Ignored,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Active => "ACTIVE",
            LifecycleStatus::Expired => "EXPIRED",
            LifecycleStatus::Retired => "RETIRED",
            LifecycleStatus::Ignored => "IGNORED",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleStatus::Active)
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ACTIVE" => Ok(LifecycleStatus::Active),
            "EXPIRED" => Ok(LifecycleStatus::Expired),
            "RETIRED" => Ok(LifecycleStatus::Retired),
            "IGNORED" => Ok(LifecycleStatus::Ignored),
            _ => Err(SchemaError::unknown("lifecycle status", s)),
        }
    }
}

/// Identity of one persisted series; exactly one watermark exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatermarkKey {
    pub source_id: String,
    pub entity_id: String,
    pub kind: DataKind,
    pub interval: Interval,
}

impl fmt::Display for WatermarkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {} {}",
            self.source_id, self.entity_id, self.kind, self.interval
        )
    }
}

/// One (source, entity, kind, interval) series to keep in sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    /// Exchange / market identifier
    pub source_id: String,
    /// Instrument identifier within the source
    pub entity_id: String,
    pub interval: Interval,
    pub kind: DataKind,
    pub lifecycle_status: LifecycleStatus,
    /// Earliest timestamp known for the entity, used only on cold start
    pub first_available_at: Option<DateTime<Utc>>,
    /// Last real update; clamps the window of non-active entities
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl SyncTarget {
    pub fn new(
        source_id: impl Into<String>,
        entity_id: impl Into<String>,
        kind: DataKind,
        interval: Interval,
        lifecycle_status: LifecycleStatus,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            entity_id: entity_id.into(),
            interval,
            kind,
            lifecycle_status,
            first_available_at: None,
            last_activity_at: None,
        }
    }

    pub fn with_first_available_at(mut self, ts: DateTime<Utc>) -> Self {
        self.first_available_at = Some(ts);
        self
    }

    pub fn with_last_activity_at(mut self, ts: DateTime<Utc>) -> Self {
        self.last_activity_at = Some(ts);
        self
    }

    pub fn key(&self) -> WatermarkKey {
        WatermarkKey {
            source_id: self.source_id.clone(),
            entity_id: self.entity_id.clone(),
            kind: self.kind,
            interval: self.interval,
        }
    }
}

/// Inclusive range of period starts requested in one remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Number of periods requested, never above the page limit
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_interval_floor() {
        let t = ts(2024, 1, 10, 13, 47);
        assert_eq!(Interval::Day.floor(t), ts(2024, 1, 10, 0, 0));
        assert_eq!(Interval::Hour.floor(t), ts(2024, 1, 10, 13, 0));
        assert_eq!(Interval::Minute.floor(t), t);
    }

    #[test]
    fn test_last_closed_period() {
        assert_eq!(
            Interval::Day.last_closed(ts(2024, 1, 10, 0, 0)),
            ts(2024, 1, 9, 0, 0)
        );
        assert_eq!(
            Interval::Hour.last_closed(ts(2024, 1, 10, 13, 47)),
            ts(2024, 1, 10, 12, 0)
        );
    }

    #[test]
    fn test_periods_between() {
        assert_eq!(
            Interval::Day.periods_between(ts(2024, 1, 6, 0, 0), ts(2024, 1, 9, 0, 0)),
            3
        );
        // Unaligned start counts calendar days, like a date difference
        assert_eq!(
            Interval::Day.periods_between(ts(2024, 1, 6, 18, 0), ts(2024, 1, 9, 0, 0)),
            3
        );
        assert_eq!(
            Interval::Hour.periods_between(ts(2024, 1, 9, 0, 0), ts(2024, 1, 6, 0, 0)),
            -72
        );
    }

    #[test]
    fn test_parse_interval_and_kind() {
        assert_eq!("1d".parse::<Interval>().unwrap(), Interval::Day);
        assert_eq!("hour".parse::<Interval>().unwrap(), Interval::Hour);
        assert!("1w".parse::<Interval>().is_err());

        assert_eq!("funding_rate".parse::<DataKind>().unwrap(), DataKind::FundingRate);
        assert_eq!("open-interest".parse::<DataKind>().unwrap(), DataKind::OpenInterest);
        assert_eq!("spot_ohlcv".parse::<DataKind>().unwrap(), DataKind::SpotOhlcv);
        assert_eq!("index".parse::<DataKind>().unwrap(), DataKind::IndexOhlcv);
        assert!(matches!(
            "trades".parse::<DataKind>(),
            Err(SchemaError::Unknown { what: "data kind", .. })
        ));
    }

    #[test]
    fn test_kind_round_trips_through_its_name() {
        for kind in DataKind::ALL {
            assert_eq!(kind.as_str().parse::<DataKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_spot_and_index_kinds() {
        assert_eq!(DataKind::SpotOhlcv.market(), Market::Spot);
        assert_eq!(DataKind::SpotOhlcv.table_base(), "spot_ohlcv");
        assert_eq!(DataKind::SpotOhlcv.first_available_column(), "first_trade_datetime");

        assert_eq!(DataKind::IndexOhlcv.market(), Market::Index);
        assert_eq!(DataKind::IndexOhlcv.table_base(), "index_ohlcv");
        assert_eq!(DataKind::IndexOhlcv.last_activity_column(), "last_message_datetime");

        assert_eq!(DataKind::FundingRate.market(), Market::Futures);
    }

    #[test]
    fn test_parse_lifecycle_status() {
        assert_eq!("active".parse::<LifecycleStatus>().unwrap(), LifecycleStatus::Active);
        assert_eq!(" RETIRED ".parse::<LifecycleStatus>().unwrap(), LifecycleStatus::Retired);
        assert!("DELISTED".parse::<LifecycleStatus>().is_err());
    }

    #[test]
    fn test_watermark_key_display() {
        let target = SyncTarget::new(
            "binance",
            "BTC-USDT-VANILLA-PERPETUAL",
            DataKind::Ohlcv,
            Interval::Day,
            LifecycleStatus::Active,
        );
        assert_eq!(
            target.key().to_string(),
            "binance:BTC-USDT-VANILLA-PERPETUAL ohlcv 1d"
        );
    }
}
