//! In-memory persistence gateway for tests
//!
//! Mirrors the PostgreSQL gateway's replace-by-key semantics. An append-only
//! mode keeps every written row so compaction has duplicates to remove.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use feed_common::error::DatabaseError;

use super::gateway::{batch_kind, CompactionStats, GatewayError, GatewayResult, PersistenceGateway};
use crate::schema::{
    NormalizedRecord, TableName, WatermarkKey, COLLECTED_AT_COLUMN, ENTITY_COLUMN, KEY_COLUMNS,
    SOURCE_COLUMN, TIMESTAMP_COLUMN,
};

/// Failure injected for writes of one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Connection-level failure, classified transient
    Transient,
    /// Query failure, classified permanent
    Permanent,
}

impl InjectedFailure {
    fn to_error(self, entity_id: &str) -> GatewayError {
        match self {
            InjectedFailure::Transient => {
                DatabaseError::Connection(format!("injected connection reset for {}", entity_id)).into()
            }
            InjectedFailure::Permanent => {
                DatabaseError::Query(format!("injected constraint violation for {}", entity_id)).into()
            }
        }
    }
}

/// In-memory [`PersistenceGateway`]
pub struct MemoryGateway {
    schema: Option<String>,
    tables: RwLock<HashMap<TableName, Vec<NormalizedRecord>>>,
    append_only: bool,
    failures: Mutex<HashMap<String, InjectedFailure>>,
    upserts: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            schema: Some("market".to_string()),
            tables: RwLock::new(HashMap::new()),
            append_only: false,
            failures: Mutex::new(HashMap::new()),
            upserts: AtomicUsize::new(0),
        }
    }

    /// Keep every written row instead of replacing by key
    pub fn append_only(mut self) -> Self {
        self.append_only = true;
        self
    }

    /// Fail every write touching `entity_id`
    pub fn with_failure(self, entity_id: &str, failure: InjectedFailure) -> Self {
        self.failures.lock().insert(entity_id.to_string(), failure);
        self
    }

    pub fn clear_failure(&self, entity_id: &str) {
        self.failures.lock().remove(entity_id);
    }

    /// Successful `batch_upsert` calls so far
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Snapshot of a table, ordered by natural key
    pub fn rows(&self, table: &TableName) -> Vec<NormalizedRecord> {
        let mut rows = self.tables.read().get(table).cloned().unwrap_or_default();
        rows.sort_by(|a, b| a.natural_key().cmp(&b.natural_key()));
        rows
    }

    /// Rows of one series, ordered by timestamp
    pub fn series_rows(&self, key: &WatermarkKey) -> GatewayResult<Vec<NormalizedRecord>> {
        let table = self.table_for(key.kind, key.interval)?;
        Ok(self
            .rows(&table)
            .into_iter()
            .filter(|r| r.source_id == key.source_id && r.entity_id == key.entity_id)
            .collect())
    }

    /// Seed rows directly, bypassing failure injection
    pub fn insert_rows(&self, table: &TableName, rows: Vec<NormalizedRecord>) {
        self.tables.write().entry(table.clone()).or_default().extend(rows);
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn known_column(column: &str) -> bool {
    KEY_COLUMNS.contains(&column) || column == COLLECTED_AT_COLUMN
}

fn owned_key(row: &NormalizedRecord) -> (DateTime<Utc>, String, String) {
    (row.timestamp, row.source_id.clone(), row.entity_id.clone())
}

fn key_of(row: &NormalizedRecord, columns: &[&str]) -> Vec<String> {
    columns
        .iter()
        .map(|column| match *column {
            TIMESTAMP_COLUMN => row.timestamp.to_rfc3339(),
            SOURCE_COLUMN => row.source_id.clone(),
            ENTITY_COLUMN => row.entity_id.clone(),
            _ => row.collected_at.to_rfc3339(),
        })
        .collect()
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    async fn get_watermark(&self, key: &WatermarkKey) -> GatewayResult<Option<DateTime<Utc>>> {
        let table = self.table_for(key.kind, key.interval)?;
        Ok(self.tables.read().get(&table).and_then(|rows| {
            rows.iter()
                .filter(|r| r.source_id == key.source_id && r.entity_id == key.entity_id)
                .map(|r| r.timestamp)
                .max()
        }))
    }

    async fn batch_upsert(&self, rows: &[NormalizedRecord], table: &TableName) -> GatewayResult<u64> {
        if batch_kind(rows)?.is_none() {
            return Ok(0);
        }

        {
            let failures = self.failures.lock();
            if let Some((entity, failure)) = rows
                .iter()
                .find_map(|r| failures.get(&r.entity_id).map(|f| (&r.entity_id, *f)))
            {
                return Err(failure.to_error(entity));
            }
        }

        // Freshest copy per key within the batch
        let mut incoming: HashMap<(DateTime<Utc>, String, String), &NormalizedRecord> = HashMap::new();
        for row in rows {
            incoming
                .entry(owned_key(row))
                .and_modify(|existing| {
                    if row.collected_at >= existing.collected_at {
                        *existing = row;
                    }
                })
                .or_insert(row);
        }

        let mut tables = self.tables.write();
        let stored = tables.entry(table.clone()).or_default();
        if !self.append_only {
            stored.retain(|r| !incoming.contains_key(&owned_key(r)));
        }
        let written = incoming.len() as u64;
        stored.extend(incoming.into_values().cloned());

        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }

    async fn compact(
        &self,
        table: &TableName,
        key_columns: &[&str],
        tie_break_column: &str,
    ) -> GatewayResult<CompactionStats> {
        for column in key_columns.iter().chain(std::iter::once(&tie_break_column)) {
            if !known_column(column) {
                return Err(GatewayError::UnknownColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
        }

        let mut tables = self.tables.write();
        let stored = tables
            .get_mut(table)
            .ok_or_else(|| GatewayError::TableNotFound(table.to_string()))?;

        let rows_before = stored.len() as u64;
        let mut kept: HashMap<Vec<String>, NormalizedRecord> = HashMap::new();
        for row in stored.drain(..) {
            let tie = key_of(&row, &[tie_break_column]);
            kept.entry(key_of(&row, key_columns))
                .and_modify(|existing| {
                    if tie > key_of(existing, &[tie_break_column]) {
                        *existing = row.clone();
                    }
                })
                .or_insert(row);
        }
        stored.extend(kept.into_values());

        Ok(CompactionStats {
            rows_before,
            rows_after: stored.len() as u64,
        })
    }

    async fn series_timestamps(
        &self,
        key: &WatermarkKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> GatewayResult<Vec<DateTime<Utc>>> {
        let mut stamps: Vec<DateTime<Utc>> = self
            .series_rows(key)?
            .into_iter()
            .map(|r| r.timestamp)
            .filter(|ts| *ts >= start && *ts <= end)
            .collect();
        stamps.dedup();
        Ok(stamps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ContractInfo, DataKind, Interval, OhlcvFields, RecordFields};
    use chrono::TimeZone;
    use feed_common::ErrorClassification;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn record(entity: &str, ts: DateTime<Utc>, collected_at: DateTime<Utc>, close: rust_decimal::Decimal) -> NormalizedRecord {
        NormalizedRecord {
            timestamp: ts,
            source_id: "binance".to_string(),
            entity_id: entity.to_string(),
            instrument: None,
            contract: ContractInfo::default(),
            fields: RecordFields::Ohlcv(OhlcvFields {
                close: Some(close),
                ..Default::default()
            }),
            collected_at,
        }
    }

    fn key(entity: &str) -> WatermarkKey {
        WatermarkKey {
            source_id: "binance".to_string(),
            entity_id: entity.to_string(),
            kind: DataKind::Ohlcv,
            interval: Interval::Day,
        }
    }

    fn close_of(row: &NormalizedRecord) -> Option<rust_decimal::Decimal> {
        match &row.fields {
            RecordFields::Ohlcv(f) => f.close,
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_key() {
        let gateway = MemoryGateway::new();
        let table = gateway.table_for(DataKind::Ohlcv, Interval::Day).unwrap();

        gateway
            .batch_upsert(&[record("BTC", day(8), day(10), dec!(1)), record("BTC", day(9), day(10), dec!(2))], &table)
            .await
            .unwrap();
        gateway
            .batch_upsert(&[record("BTC", day(9), day(11), dec!(3))], &table)
            .await
            .unwrap();

        let rows = gateway.rows(&table);
        assert_eq!(rows.len(), 2);
        assert_eq!(close_of(&rows[1]), Some(dec!(3)));
        assert_eq!(gateway.get_watermark(&key("BTC")).await.unwrap(), Some(day(9)));
        assert_eq!(gateway.get_watermark(&key("ETH")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_keys_in_one_batch_keep_latest() {
        let gateway = MemoryGateway::new();
        let table = gateway.table_for(DataKind::Ohlcv, Interval::Day).unwrap();

        let written = gateway
            .batch_upsert(&[record("BTC", day(9), day(12), dec!(5)), record("BTC", day(9), day(10), dec!(4))], &table)
            .await
            .unwrap();

        assert_eq!(written, 1);
        assert_eq!(close_of(&gateway.rows(&table)[0]), Some(dec!(5)));
    }

    #[tokio::test]
    async fn test_compaction_keeps_latest_collected() {
        let gateway = MemoryGateway::new().append_only();
        let table = gateway.table_for(DataKind::Ohlcv, Interval::Day).unwrap();

        for (collected, close) in [(day(10), dec!(1)), (day(12), dec!(3)), (day(11), dec!(2))] {
            gateway
                .batch_upsert(&[record("BTC", day(9), collected, close)], &table)
                .await
                .unwrap();
        }
        assert_eq!(gateway.rows(&table).len(), 3);

        let stats = gateway.compact(&table, &KEY_COLUMNS, COLLECTED_AT_COLUMN).await.unwrap();
        assert_eq!(stats.rows_before, 3);
        assert_eq!(stats.rows_after, 1);
        assert_eq!(close_of(&gateway.rows(&table)[0]), Some(dec!(3)));

        // Idempotent
        let again = gateway.compact(&table, &KEY_COLUMNS, COLLECTED_AT_COLUMN).await.unwrap();
        assert_eq!(again.removed(), 0);
    }

    #[tokio::test]
    async fn test_compaction_errors() {
        let gateway = MemoryGateway::new();
        let table = gateway.table_for(DataKind::Ohlcv, Interval::Day).unwrap();

        let err = gateway.compact(&table, &KEY_COLUMNS, COLLECTED_AT_COLUMN).await.unwrap_err();
        assert!(matches!(err, GatewayError::TableNotFound(_)));

        let err = gateway.compact(&table, &["nope"], COLLECTED_AT_COLUMN).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownColumn { .. }));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let gateway = MemoryGateway::new()
            .with_failure("BTC", InjectedFailure::Transient)
            .with_failure("ETH", InjectedFailure::Permanent);
        let table = gateway.table_for(DataKind::Ohlcv, Interval::Day).unwrap();

        let err = gateway.batch_upsert(&[record("BTC", day(9), day(10), dec!(1))], &table).await.unwrap_err();
        assert!(err.is_transient());
        let err = gateway.batch_upsert(&[record("ETH", day(9), day(10), dec!(1))], &table).await.unwrap_err();
        assert!(err.is_permanent());

        assert!(gateway.rows(&table).is_empty());
        assert_eq!(gateway.upsert_count(), 0);

        gateway.clear_failure("BTC");
        gateway.batch_upsert(&[record("BTC", day(9), day(10), dec!(1))], &table).await.unwrap();
        assert_eq!(gateway.upsert_count(), 1);
    }

    #[tokio::test]
    async fn test_series_timestamps_in_range() {
        let gateway = MemoryGateway::new();
        let table = gateway.table_for(DataKind::Ohlcv, Interval::Day).unwrap();
        let rows: Vec<_> = [3, 4, 6, 9].iter().map(|d| record("BTC", day(*d), day(10), dec!(1))).collect();
        gateway.insert_rows(&table, rows);

        let stamps = gateway.series_timestamps(&key("BTC"), day(4), day(8)).await.unwrap();
        assert_eq!(stamps, vec![day(4), day(6)]);
    }
}
