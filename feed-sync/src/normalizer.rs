//! Record normalizer
//!
//! Converts one raw provider record into a [`NormalizedRecord`] for a given
//! [`DataKind`]. Only the primary key fields are mandatory; everything else
//! decodes leniently to `None`.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::schema::{
    ContractInfo, DataKind, FieldValue, FundingRateFields, IndexOhlcvFields, NormalizedRecord,
    OhlcvFields, OpenInterestFields, RecordFields, SpotOhlcvFields,
};

/// A raw record that cannot be keyed and must be skipped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MalformedRecordError {
    #[error("Record is not a JSON object")]
    NotAnObject,

    #[error("Missing primary key field: {0}")]
    MissingKeyField(&'static str),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Undecodable record: {0}")]
    Undecodable(String),
}

/// Primary key fields as delivered by the provider
#[derive(Debug, Deserialize)]
struct RawKey {
    #[serde(rename = "TIMESTAMP", default)]
    timestamp: Option<serde_json::Value>,
    #[serde(rename = "MARKET", default)]
    market: Option<serde_json::Value>,
    #[serde(rename = "INSTRUMENT", default)]
    instrument: Option<serde_json::Value>,
    #[serde(rename = "MAPPED_INSTRUMENT", default)]
    mapped_instrument: Option<serde_json::Value>,
}

fn non_empty_string(value: Option<&serde_json::Value>) -> Option<String> {
    value
        .and_then(String::from_json)
        .filter(|s| !s.trim().is_empty())
}

/// Normalize one raw record, stamping `collected_at` with the current time
pub fn normalize(
    raw: &serde_json::Value,
    kind: DataKind,
) -> Result<NormalizedRecord, MalformedRecordError> {
    normalize_at(raw, kind, Utc::now())
}

/// Normalize one raw record with an explicit `collected_at`
pub fn normalize_at(
    raw: &serde_json::Value,
    kind: DataKind,
    collected_at: DateTime<Utc>,
) -> Result<NormalizedRecord, MalformedRecordError> {
    if !raw.is_object() {
        return Err(MalformedRecordError::NotAnObject);
    }

    let undecodable = |e: serde_json::Error| MalformedRecordError::Undecodable(e.to_string());
    let key = RawKey::deserialize(raw).map_err(undecodable)?;

    let raw_ts = key
        .timestamp
        .filter(|v| !v.is_null())
        .ok_or(MalformedRecordError::MissingKeyField("TIMESTAMP"))?;
    let timestamp = DateTime::<Utc>::from_json(&raw_ts)
        .ok_or_else(|| MalformedRecordError::InvalidTimestamp(raw_ts.to_string()))?;

    let source_id = non_empty_string(key.market.as_ref())
        .ok_or(MalformedRecordError::MissingKeyField("MARKET"))?;

    let instrument = non_empty_string(key.instrument.as_ref());
    let entity_id = non_empty_string(key.mapped_instrument.as_ref())
        .or_else(|| instrument.clone())
        .ok_or(MalformedRecordError::MissingKeyField("MAPPED_INSTRUMENT"))?;

    let contract = ContractInfo::deserialize(raw).map_err(undecodable)?;
    let fields = match kind {
        DataKind::Ohlcv => RecordFields::Ohlcv(OhlcvFields::deserialize(raw).map_err(undecodable)?),
        DataKind::FundingRate => {
            RecordFields::FundingRate(FundingRateFields::deserialize(raw).map_err(undecodable)?)
        }
        DataKind::OpenInterest => {
            RecordFields::OpenInterest(OpenInterestFields::deserialize(raw).map_err(undecodable)?)
        }
        DataKind::SpotOhlcv => {
            RecordFields::SpotOhlcv(SpotOhlcvFields::deserialize(raw).map_err(undecodable)?)
        }
        DataKind::IndexOhlcv => {
            RecordFields::IndexOhlcv(IndexOhlcvFields::deserialize(raw).map_err(undecodable)?)
        }
    };

    Ok(NormalizedRecord {
        timestamp,
        source_id,
        entity_id,
        instrument,
        contract,
        fields,
        collected_at,
    })
}

/// Normalize a page, skipping and logging malformed records
///
/// Returns the normalized records and the number of records skipped.
pub fn normalize_page(raw: &[serde_json::Value], kind: DataKind) -> (Vec<NormalizedRecord>, usize) {
    let collected_at = Utc::now();
    let mut records = Vec::with_capacity(raw.len());
    let mut skipped = 0;

    for (index, entry) in raw.iter().enumerate() {
        match normalize_at(entry, kind, collected_at) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                warn!(kind = %kind, index, "Skipping malformed record: {}", e);
            }
        }
    }

    (records, skipped)
}
