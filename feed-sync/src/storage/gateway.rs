//! Persistence gateway contract
//!
//! The only component that reads watermarks or writes series rows.
//! Implementations: [`PgGateway`](super::PgGateway) for PostgreSQL and
//! [`MemoryGateway`](super::MemoryGateway) for tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use feed_common::error::{DatabaseError, ErrorCategory, ErrorClassification};

use crate::schema::{DataKind, Interval, NormalizedRecord, SchemaError, TableName, WatermarkKey};

/// Gateway errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Staging file error: {0}")]
    Staging(#[from] std::io::Error),

    #[error("CSV encoding error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Unknown column '{column}' in {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Batch mixes data kinds: expected {expected}, found {found}")]
    MixedKinds { expected: DataKind, found: DataKind },
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Database(err.into())
    }
}

impl ErrorClassification for GatewayError {
    fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::Database(e) => e.category(),
            GatewayError::Staging(_) => ErrorCategory::Internal,
            GatewayError::Csv(_) => ErrorCategory::Internal,
            GatewayError::Schema(_) => ErrorCategory::Configuration,
            GatewayError::TableNotFound(_) => ErrorCategory::Configuration,
            GatewayError::UnknownColumn { .. } => ErrorCategory::Configuration,
            GatewayError::MixedKinds { .. } => ErrorCategory::Internal,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            GatewayError::Database(e) => e.suggested_retry_delay(),
            _ => None,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Row counts around a compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    pub rows_before: u64,
    pub rows_after: u64,
}

impl CompactionStats {
    pub fn removed(&self) -> u64 {
        self.rows_before.saturating_sub(self.rows_after)
    }
}

/// Connection-pooled, retry-aware store for series rows
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Schema holding the series tables, if any
    fn schema(&self) -> Option<&str>;

    /// Table holding a kind at an interval
    fn table_for(&self, kind: DataKind, interval: Interval) -> GatewayResult<TableName> {
        Ok(TableName::for_series(self.schema(), kind, interval)?)
    }

    /// Latest timestamp durably persisted for a series
    async fn get_watermark(&self, key: &WatermarkKey) -> GatewayResult<Option<DateTime<Utc>>>;

    /// Replace-by-natural-key write of one batch; returns rows written
    async fn batch_upsert(&self, rows: &[NormalizedRecord], table: &TableName) -> GatewayResult<u64>;

    /// Rebuild `table` keeping, per key, only the row with the largest tie-break value
    async fn compact(
        &self,
        table: &TableName,
        key_columns: &[&str],
        tie_break_column: &str,
    ) -> GatewayResult<CompactionStats>;

    /// Distinct persisted period starts of a series within `[start, end]`, ascending
    async fn series_timestamps(
        &self,
        key: &WatermarkKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> GatewayResult<Vec<DateTime<Utc>>>;
}

/// Reject batches whose records do not all share one kind
pub(crate) fn batch_kind(rows: &[NormalizedRecord]) -> GatewayResult<Option<DataKind>> {
    let Some(first) = rows.first() else {
        return Ok(None);
    };
    let expected = first.kind();
    if let Some(other) = rows.iter().find(|r| r.kind() != expected) {
        return Err(GatewayError::MixedKinds {
            expected,
            found: other.kind(),
        });
    }
    Ok(Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_delegates_to_database_error() {
        let err: GatewayError = sqlx::Error::PoolClosed.into();
        assert!(err.is_transient());

        let err = GatewayError::Database(DatabaseError::Query("syntax error at or near".into()));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_staging_errors_are_not_retried() {
        let err = GatewayError::Staging(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_compaction_stats_removed() {
        let stats = CompactionStats {
            rows_before: 10,
            rows_after: 7,
        };
        assert_eq!(stats.removed(), 3);
    }
}
