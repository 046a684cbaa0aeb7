//! Normalized record types
//!
//! One typed field struct per [`DataKind`]. Each struct is declared through
//! [`record_fields!`], which pairs every column with the provider field it is
//! decoded from. A missing or unusable provider value decodes to `None`,
//! never to zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

use super::{DataKind, Market};

pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const SOURCE_COLUMN: &str = "market";
pub const ENTITY_COLUMN: &str = "mapped_instrument";
pub const INSTRUMENT_COLUMN: &str = "instrument";
pub const COLLECTED_AT_COLUMN: &str = "collected_at";

/// Natural key of every series table
pub const KEY_COLUMNS: [&str; 3] = [TIMESTAMP_COLUMN, SOURCE_COLUMN, ENTITY_COLUMN];

/// A scalar that can be read leniently from JSON and written as a CSV cell
pub trait FieldValue: Sized {
    fn from_json(value: &serde_json::Value) -> Option<Self>;
    fn to_cell(&self) -> String;
}

impl FieldValue for Decimal {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        let text = match value {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s.trim().to_string(),
            _ => return None,
        };
        text.parse::<Decimal>()
            .ok()
            .or_else(|| Decimal::from_scientific(&text).ok())
    }

    fn to_cell(&self) -> String {
        self.normalize().to_string()
    }
}

impl FieldValue for i64 {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            }),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn to_cell(&self) -> String {
        self.to_string()
    }
}

/// Epoch seconds on the wire, UTC timestamps in memory
impl FieldValue for DateTime<Utc> {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        i64::from_json(value).and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    fn to_cell(&self) -> String {
        self.to_rfc3339()
    }
}

impl FieldValue for String {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn to_cell(&self) -> String {
        self.clone()
    }
}

/// `deserialize_with` hook: anything that is not a usable value becomes `None`
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FieldValue,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::from_json(&value))
}

macro_rules! record_fields {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty => $raw:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Deserialize)]
        pub struct $name {
            $(
                $(#[$fmeta])*
                #[serde(rename = $raw, default, deserialize_with = "lenient")]
                pub $field: Option<$ty>,
            )+
        }

        impl $name {
            /// Column names, in staging order
            pub const COLUMNS: &'static [&'static str] = &[$(stringify!($field)),+];

            /// Provider field names, aligned with `COLUMNS`
            pub const PROVIDER_FIELDS: &'static [&'static str] = &[$($raw),+];

            /// CSV cells aligned with `COLUMNS`; `None` is written as NULL
            pub fn cells(&self) -> Vec<Option<String>> {
                vec![$(self.$field.as_ref().map(FieldValue::to_cell)),+]
            }
        }
    };
}

record_fields! {
    /// Contract descriptors shared by every futures series
    pub struct ContractInfo {
        contract_type: String => "TYPE",
        index_underlying: String => "INDEX_UNDERLYING",
        quote_currency: String => "QUOTE_CURRENCY",
        settlement_currency: String => "SETTLEMENT_CURRENCY",
        contract_currency: String => "CONTRACT_CURRENCY",
        denomination_type: String => "DENOMINATION_TYPE",
    }
}

record_fields! {
    /// Trade candle for one period
    pub struct OhlcvFields {
        open: Decimal => "OPEN",
        high: Decimal => "HIGH",
        low: Decimal => "LOW",
        close: Decimal => "CLOSE",
        number_of_contracts: Decimal => "NUMBER_OF_CONTRACTS",
        volume: Decimal => "VOLUME",
        quote_volume: Decimal => "QUOTE_VOLUME",
        volume_buy: Decimal => "VOLUME_BUY",
        quote_volume_buy: Decimal => "QUOTE_VOLUME_BUY",
        volume_sell: Decimal => "VOLUME_SELL",
        quote_volume_sell: Decimal => "QUOTE_VOLUME_SELL",
        volume_unknown: Decimal => "VOLUME_UNKNOWN",
        quote_volume_unknown: Decimal => "QUOTE_VOLUME_UNKNOWN",
        total_trades: i64 => "TOTAL_TRADES",
        total_trades_buy: i64 => "TOTAL_TRADES_BUY",
        total_trades_sell: i64 => "TOTAL_TRADES_SELL",
        total_trades_unknown: i64 => "TOTAL_TRADES_UNKNOWN",
        first_trade_timestamp: DateTime<Utc> => "FIRST_TRADE_TIMESTAMP",
        last_trade_timestamp: DateTime<Utc> => "LAST_TRADE_TIMESTAMP",
        first_trade_price: Decimal => "FIRST_TRADE_PRICE",
        high_trade_price: Decimal => "HIGH_TRADE_PRICE",
        high_trade_timestamp: DateTime<Utc> => "HIGH_TRADE_TIMESTAMP",
        low_trade_price: Decimal => "LOW_TRADE_PRICE",
        low_trade_timestamp: DateTime<Utc> => "LOW_TRADE_TIMESTAMP",
        last_trade_price: Decimal => "LAST_TRADE_PRICE",
    }
}

record_fields! {
    /// Funding rate candle for one period
    pub struct FundingRateFields {
        interval_ms: i64 => "INTERVAL_MS",
        open_fr: Decimal => "OPEN",
        high_fr: Decimal => "HIGH",
        low_fr: Decimal => "LOW",
        close_fr: Decimal => "CLOSE",
        total_funding_rate_updates: i64 => "TOTAL_FUNDING_RATE_UPDATES",
    }
}

record_fields! {
    /// Open interest candle for one period
    pub struct OpenInterestFields {
        open_oi_contracts: Decimal => "OPEN_SETTLEMENT",
        high_oi_contracts: Decimal => "HIGH_SETTLEMENT",
        low_oi_contracts: Decimal => "LOW_SETTLEMENT",
        close_oi_contracts: Decimal => "CLOSE_SETTLEMENT",
        open_oi_quote: Decimal => "OPEN_QUOTE",
        high_oi_quote: Decimal => "HIGH_QUOTE",
        low_oi_quote: Decimal => "LOW_QUOTE",
        close_oi_quote: Decimal => "CLOSE_QUOTE",
        open_mark_price: Decimal => "OPEN_MARK_PRICE",
        high_oi_mark_price: Decimal => "HIGH_SETTLEMENT_MARK_PRICE",
        high_mark_price: Decimal => "HIGH_MARK_PRICE",
        high_mark_price_oi: Decimal => "HIGH_MARK_PRICE_SETTLEMENT",
        high_quote_mark_price: Decimal => "HIGH_QUOTE_MARK_PRICE",
        low_oi_mark_price: Decimal => "LOW_SETTLEMENT_MARK_PRICE",
        low_mark_price: Decimal => "LOW_MARK_PRICE",
        low_mark_price_oi: Decimal => "LOW_MARK_PRICE_SETTLEMENT",
        low_quote_mark_price: Decimal => "LOW_QUOTE_MARK_PRICE",
        close_mark_price: Decimal => "CLOSE_MARK_PRICE",
        total_open_interest_updates: i64 => "TOTAL_OPEN_INTEREST_UPDATES",
    }
}

record_fields! {
    /// Spot trade candle for one exchange pair
    pub struct SpotOhlcvFields {
        base: String => "BASE",
        quote: String => "QUOTE",
        open: Decimal => "OPEN",
        high: Decimal => "HIGH",
        low: Decimal => "LOW",
        close: Decimal => "CLOSE",
        volume: Decimal => "VOLUME",
        quote_volume: Decimal => "QUOTE_VOLUME",
        volume_buy: Decimal => "VOLUME_BUY",
        quote_volume_buy: Decimal => "QUOTE_VOLUME_BUY",
        volume_sell: Decimal => "VOLUME_SELL",
        quote_volume_sell: Decimal => "QUOTE_VOLUME_SELL",
        volume_unknown: Decimal => "VOLUME_UNKNOWN",
        quote_volume_unknown: Decimal => "QUOTE_VOLUME_UNKNOWN",
        total_trades: i64 => "TOTAL_TRADES",
        total_trades_buy: i64 => "TOTAL_TRADES_BUY",
        total_trades_sell: i64 => "TOTAL_TRADES_SELL",
        total_trades_unknown: i64 => "TOTAL_TRADES_UNKNOWN",
        first_trade_timestamp: DateTime<Utc> => "FIRST_TRADE_TIMESTAMP",
        last_trade_timestamp: DateTime<Utc> => "LAST_TRADE_TIMESTAMP",
        first_trade_price: Decimal => "FIRST_TRADE_PRICE",
        high_trade_price: Decimal => "HIGH_TRADE_PRICE",
        high_trade_timestamp: DateTime<Utc> => "HIGH_TRADE_TIMESTAMP",
        low_trade_price: Decimal => "LOW_TRADE_PRICE",
        low_trade_timestamp: DateTime<Utc> => "LOW_TRADE_TIMESTAMP",
        last_trade_price: Decimal => "LAST_TRADE_PRICE",
    }
}

record_fields! {
    /// Index candle; prices are index values, volumes aggregate the constituents
    pub struct IndexOhlcvFields {
        unit: String => "UNIT",
        index_type: String => "TYPE",
        asset: String => "ASSET",
        quote: String => "QUOTE",
        open: Decimal => "OPEN",
        high: Decimal => "HIGH",
        low: Decimal => "LOW",
        close: Decimal => "CLOSE",
        first_message_timestamp: DateTime<Utc> => "FIRST_MESSAGE_TIMESTAMP",
        last_message_timestamp: DateTime<Utc> => "LAST_MESSAGE_TIMESTAMP",
        first_message_value: Decimal => "FIRST_MESSAGE_VALUE",
        high_message_value: Decimal => "HIGH_MESSAGE_VALUE",
        high_message_timestamp: DateTime<Utc> => "HIGH_MESSAGE_TIMESTAMP",
        low_message_value: Decimal => "LOW_MESSAGE_VALUE",
        low_message_timestamp: DateTime<Utc> => "LOW_MESSAGE_TIMESTAMP",
        last_message_value: Decimal => "LAST_MESSAGE_VALUE",
        total_index_updates: i64 => "TOTAL_INDEX_UPDATES",
        volume: Decimal => "VOLUME",
        quote_volume: Decimal => "QUOTE_VOLUME",
        volume_top_tier: Decimal => "VOLUME_TOP_TIER",
        quote_volume_top_tier: Decimal => "QUOTE_VOLUME_TOP_TIER",
        volume_direct: Decimal => "VOLUME_DIRECT",
        quote_volume_direct: Decimal => "QUOTE_VOLUME_DIRECT",
        volume_top_tier_direct: Decimal => "VOLUME_TOP_TIER_DIRECT",
        quote_volume_top_tier_direct: Decimal => "QUOTE_VOLUME_TOP_TIER_DIRECT",
    }
}

/// Kind-specific payload of a normalized record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordFields {
    Ohlcv(OhlcvFields),
    FundingRate(FundingRateFields),
    OpenInterest(OpenInterestFields),
    SpotOhlcv(SpotOhlcvFields),
    IndexOhlcv(IndexOhlcvFields),
}

impl RecordFields {
    pub fn kind(&self) -> DataKind {
        match self {
            RecordFields::Ohlcv(_) => DataKind::Ohlcv,
            RecordFields::FundingRate(_) => DataKind::FundingRate,
            RecordFields::OpenInterest(_) => DataKind::OpenInterest,
            RecordFields::SpotOhlcv(_) => DataKind::SpotOhlcv,
            RecordFields::IndexOhlcv(_) => DataKind::IndexOhlcv,
        }
    }

    /// Column names of the kind-specific payload
    pub fn columns(kind: DataKind) -> &'static [&'static str] {
        match kind {
            DataKind::Ohlcv => OhlcvFields::COLUMNS,
            DataKind::FundingRate => FundingRateFields::COLUMNS,
            DataKind::OpenInterest => OpenInterestFields::COLUMNS,
            DataKind::SpotOhlcv => SpotOhlcvFields::COLUMNS,
            DataKind::IndexOhlcv => IndexOhlcvFields::COLUMNS,
        }
    }

    fn cells(&self) -> Vec<Option<String>> {
        match self {
            RecordFields::Ohlcv(f) => f.cells(),
            RecordFields::FundingRate(f) => f.cells(),
            RecordFields::OpenInterest(f) => f.cells(),
            RecordFields::SpotOhlcv(f) => f.cells(),
            RecordFields::IndexOhlcv(f) => f.cells(),
        }
    }
}

/// Contract descriptor columns only exist on futures tables
fn has_contract(kind: DataKind) -> bool {
    kind.market() == Market::Futures
}

/// Canonical row written to a series table
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// Period start
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub entity_id: String,
    /// Provider-native instrument name, when distinct from `entity_id`
    pub instrument: Option<String>,
    /// Futures only; left empty and not written for spot and index rows
    pub contract: ContractInfo,
    pub fields: RecordFields,
    /// Wall-clock time of normalization; only used to break dedup ties
    pub collected_at: DateTime<Utc>,
}

impl NormalizedRecord {
    pub fn kind(&self) -> DataKind {
        self.fields.kind()
    }

    /// Natural key of this row
    pub fn natural_key(&self) -> (DateTime<Utc>, &str, &str) {
        (self.timestamp, &self.source_id, &self.entity_id)
    }

    /// Full column list for a kind, in the order produced by [`Self::cells`]
    pub fn columns(kind: DataKind) -> Vec<&'static str> {
        let fields = RecordFields::columns(kind);

        let mut columns = Vec::with_capacity(KEY_COLUMNS.len() + 2 + ContractInfo::COLUMNS.len() + fields.len());
        columns.extend_from_slice(&KEY_COLUMNS);
        columns.push(INSTRUMENT_COLUMN);
        if has_contract(kind) {
            columns.extend_from_slice(ContractInfo::COLUMNS);
        }
        columns.extend_from_slice(fields);
        columns.push(COLLECTED_AT_COLUMN);
        columns
    }

    /// Row values aligned with [`Self::columns`]
    pub fn cells(&self) -> Vec<Option<String>> {
        let mut cells = vec![
            Some(self.timestamp.to_cell()),
            Some(self.source_id.clone()),
            Some(self.entity_id.clone()),
            self.instrument.clone(),
        ];
        if has_contract(self.kind()) {
            cells.extend(self.contract.cells());
        }
        cells.extend(self.fields.cells());
        cells.push(Some(self.collected_at.to_cell()));
        cells
    }
}
