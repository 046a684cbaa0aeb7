//! Instrument catalog: where sync targets come from
//!
//! Read-only access to instrument metadata. Each instrument row carries its
//! lifecycle status and per-kind first/last activity timestamps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tracing::{debug, warn};

use feed_common::error::{DatabaseError, ErrorCategory, ErrorClassification};

use crate::schema::{DataKind, Interval, LifecycleStatus, SchemaError, SyncTarget, TableName};

/// Catalog errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl From<sqlx::Error> for CatalogError {
    fn from(err: sqlx::Error) -> Self {
        CatalogError::Database(err.into())
    }
}

impl ErrorClassification for CatalogError {
    fn category(&self) -> ErrorCategory {
        match self {
            CatalogError::Database(e) => e.category(),
            CatalogError::Schema(_) => ErrorCategory::Configuration,
        }
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Caller-supplied target filter; an empty list means no filter
#[derive(Debug, Clone, Default)]
pub struct TargetFilter {
    pub sources: Vec<String>,
    pub entities: Vec<String>,
    pub statuses: Vec<LifecycleStatus>,
}

impl TargetFilter {
    pub fn matches(&self, target: &SyncTarget) -> bool {
        (self.sources.is_empty() || self.sources.contains(&target.source_id))
            && (self.entities.is_empty() || self.entities.contains(&target.entity_id))
            && (self.statuses.is_empty() || self.statuses.contains(&target.lifecycle_status))
    }

    fn bind_list(list: &[String]) -> Option<Vec<String>> {
        (!list.is_empty()).then(|| list.to_vec())
    }
}

/// Source of sync targets
#[async_trait]
pub trait InstrumentCatalog: Send + Sync {
    /// Targets of one kind and interval matching `filter`
    async fn list_targets(
        &self,
        filter: &TargetFilter,
        kind: DataKind,
        interval: Interval,
    ) -> CatalogResult<Vec<SyncTarget>>;
}

#[derive(Debug, FromRow)]
struct InstrumentRow {
    exchange: String,
    mapped_instrument: String,
    instrument_status: String,
    first_available_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
}

/// Catalog backed by the instruments table
pub struct PgInstrumentCatalog {
    pool: PgPool,
    table: TableName,
}

impl PgInstrumentCatalog {
    pub fn new(pool: PgPool, schema: Option<&str>, table: &str) -> CatalogResult<Self> {
        Ok(Self {
            pool,
            table: TableName::new(schema, table)?,
        })
    }
}

#[async_trait]
impl InstrumentCatalog for PgInstrumentCatalog {
    async fn list_targets(
        &self,
        filter: &TargetFilter,
        kind: DataKind,
        interval: Interval,
    ) -> CatalogResult<Vec<SyncTarget>> {
        let query = format!(
            r#"
            SELECT exchange, mapped_instrument, instrument_status,
                   "{first}" AS first_available_at,
                   "{last}" AS last_activity_at
            FROM {table}
            WHERE mapped_instrument IS NOT NULL
              AND ($1::text[] IS NULL OR exchange = ANY($1))
              AND ($2::text[] IS NULL OR mapped_instrument = ANY($2))
              AND ($3::text[] IS NULL OR UPPER(instrument_status) = ANY($3))
            ORDER BY exchange, mapped_instrument
            "#,
            first = kind.first_available_column(),
            last = kind.last_activity_column(),
            table = self.table.quoted(),
        );

        let statuses = (!filter.statuses.is_empty())
            .then(|| filter.statuses.iter().map(|s| s.as_str().to_string()).collect::<Vec<_>>());

        let rows = sqlx::query_as::<_, InstrumentRow>(&query)
            .bind(TargetFilter::bind_list(&filter.sources))
            .bind(TargetFilter::bind_list(&filter.entities))
            .bind(statuses)
            .fetch_all(&self.pool)
            .await?;

        let mut targets = Vec::with_capacity(rows.len());
        for row in rows {
            let status = match row.instrument_status.parse::<LifecycleStatus>() {
                Ok(status) => status,
                Err(e) => {
                    warn!(exchange = %row.exchange, instrument = %row.mapped_instrument, "Skipping instrument: {}", e);
                    continue;
                }
            };

            let mut target = SyncTarget::new(row.exchange, row.mapped_instrument, kind, interval, status);
            target.first_available_at = row.first_available_at;
            target.last_activity_at = row.last_activity_at;
            targets.push(target);
        }

        debug!(table = %self.table, kind = %kind, interval = %interval, count = targets.len(), "Listed targets");
        Ok(targets)
    }
}

/// Fixed target list, filtered on read
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    targets: Vec<SyncTarget>,
}

impl StaticCatalog {
    pub fn new(targets: Vec<SyncTarget>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl InstrumentCatalog for StaticCatalog {
    async fn list_targets(
        &self,
        filter: &TargetFilter,
        kind: DataKind,
        interval: Interval,
    ) -> CatalogResult<Vec<SyncTarget>> {
        Ok(self
            .targets
            .iter()
            .filter(|t| t.kind == kind && t.interval == interval && filter.matches(t))
            .cloned()
            .collect())
    }
}
