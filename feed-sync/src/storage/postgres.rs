//! PostgreSQL persistence gateway
//!
//! Batches are staged to a CSV temp file, `COPY`-loaded into a transaction
//! scoped temp table and swapped into the series table with a
//! delete-then-insert on the natural key. Compaction rebuilds the table and
//! renames it into place inside one transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

use feed_common::RetryPolicy;

use super::gateway::{CompactionStats, GatewayError, GatewayResult, PersistenceGateway};
use super::staging::{StagedBatch, NULL_MARKER};
use crate::config::DatabaseSettings;
use crate::schema::{
    quote_columns, validate_identifier, NormalizedRecord, TableName, WatermarkKey,
    COLLECTED_AT_COLUMN, ENTITY_COLUMN, KEY_COLUMNS, SOURCE_COLUMN, TIMESTAMP_COLUMN,
};

/// Session-local staging table, dropped at commit
const STAGE_TABLE: &str = "feed_sync_stage";

/// Suffix of the table built during compaction
const COMPACTED_SUFFIX: &str = "__compacted";

/// Open a connection pool from settings
pub async fn connect(settings: &DatabaseSettings) -> GatewayResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
        .connect(&settings.url)
        .await?;

    Ok(pool)
}

/// PostgreSQL-backed [`PersistenceGateway`]
#[derive(Clone)]
pub struct PgGateway {
    pool: PgPool,
    schema: Option<String>,
    retry: RetryPolicy,
}

impl PgGateway {
    /// Create a gateway on an existing pool
    pub fn new(pool: PgPool, schema: Option<&str>, retry: RetryPolicy) -> Self {
        Self {
            pool,
            schema: schema.filter(|s| !s.is_empty()).map(str::to_string),
            retry,
        }
    }

    /// One attempt at loading a staged batch; commits or rolls back as a unit
    async fn replace_staged(&self, table: &TableName, columns: &[&str], payload: &[u8]) -> GatewayResult<u64> {
        let mut tx = self.pool.begin().await?;

        match Self::replace_in_tx(&mut tx, table, columns, payload).await {
            Ok(written) => {
                tx.commit().await?;
                Ok(written)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(table = %table, "Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    async fn replace_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        table: &TableName,
        columns: &[&str],
        payload: &[u8],
    ) -> GatewayResult<u64> {
        let target = table.quoted();
        let cols = quote_columns(columns);
        let key = quote_columns(&KEY_COLUMNS);

        sqlx::query(&format!(
            "CREATE TEMP TABLE {STAGE_TABLE} (LIKE {target} INCLUDING DEFAULTS) ON COMMIT DROP"
        ))
        .execute(&mut **tx)
        .await?;

        let mut copy = tx
            .copy_in_raw(&format!(
                "COPY {STAGE_TABLE} ({cols}) FROM STDIN WITH (FORMAT csv, NULL '{NULL_MARKER}')"
            ))
            .await?;
        copy.send(payload).await?;
        let staged = copy.finish().await?;

        let key_match = KEY_COLUMNS
            .iter()
            .map(|c| format!("t.\"{c}\" = s.\"{c}\""))
            .collect::<Vec<_>>()
            .join(" AND ");
        let replaced = sqlx::query(&format!(
            "DELETE FROM {target} AS t USING {STAGE_TABLE} AS s WHERE {key_match}"
        ))
        .execute(&mut **tx)
        .await?
        .rows_affected();

        // A page can repeat a key; keep the freshest copy
        let written = sqlx::query(&format!(
            "INSERT INTO {target} ({cols}) \
             SELECT DISTINCT ON ({key}) {cols} FROM {STAGE_TABLE} \
             ORDER BY {key}, \"{COLLECTED_AT_COLUMN}\" DESC"
        ))
        .execute(&mut **tx)
        .await?
        .rows_affected();

        debug!(table = %table, staged, replaced, written, "Batch loaded");
        Ok(written)
    }

    async fn compact_once(
        &self,
        table: &TableName,
        key_columns: &[&str],
        tie_break_column: &str,
    ) -> GatewayResult<CompactionStats> {
        let mut tx = self.pool.begin().await?;

        match Self::compact_in_tx(&mut tx, table, key_columns, tie_break_column).await {
            Ok(stats) => {
                tx.commit().await?;
                Ok(stats)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(table = %table, "Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    async fn compact_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        table: &TableName,
        key_columns: &[&str],
        tie_break_column: &str,
    ) -> GatewayResult<CompactionStats> {
        let target = table.quoted();

        let columns: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = COALESCE($1, current_schema()) AND table_name = $2 \
             ORDER BY ordinal_position",
        )
        .bind(table.schema())
        .bind(table.name())
        .fetch_all(&mut **tx)
        .await?;

        if columns.is_empty() {
            return Err(GatewayError::TableNotFound(table.to_string()));
        }
        for required in key_columns.iter().chain(std::iter::once(&tie_break_column)) {
            if !columns.iter().any(|c| c == required) {
                return Err(GatewayError::UnknownColumn {
                    table: table.to_string(),
                    column: required.to_string(),
                });
            }
        }

        // Writers block here until the swap commits; readers never see a partial table
        sqlx::query(&format!("LOCK TABLE {target} IN ACCESS EXCLUSIVE MODE"))
            .execute(&mut **tx)
            .await?;

        let rows_before: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {target}"))
            .fetch_one(&mut **tx)
            .await?;

        let rebuilt = table.with_suffix(COMPACTED_SUFFIX)?;
        let cols = quote_columns(&columns);
        let partition = quote_columns(key_columns);
        let tie = validate_identifier(tie_break_column)?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", rebuilt.quoted()))
            .execute(&mut **tx)
            .await?;

        let rows_after = sqlx::query(&format!(
            "CREATE TABLE {rebuilt} AS \
             SELECT {cols} FROM ( \
                 SELECT {cols}, ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY \"{tie}\" DESC NULLS LAST) AS feed_sync_rn \
                 FROM {target} \
             ) AS ranked WHERE feed_sync_rn = 1",
            rebuilt = rebuilt.quoted(),
        ))
        .execute(&mut **tx)
        .await?
        .rows_affected();

        sqlx::query(&format!("DROP TABLE {target}"))
            .execute(&mut **tx)
            .await?;
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO \"{}\"",
            rebuilt.quoted(),
            table.name()
        ))
        .execute(&mut **tx)
        .await?;
        sqlx::query(&format!("CREATE INDEX ON {target} ({partition})"))
            .execute(&mut **tx)
            .await?;

        Ok(CompactionStats {
            rows_before: rows_before.max(0) as u64,
            rows_after,
        })
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    async fn get_watermark(&self, key: &WatermarkKey) -> GatewayResult<Option<DateTime<Utc>>> {
        let table = self.table_for(key.kind, key.interval)?;
        let sql = format!(
            "SELECT MAX(\"{TIMESTAMP_COLUMN}\") FROM {} WHERE \"{SOURCE_COLUMN}\" = $1 AND \"{ENTITY_COLUMN}\" = $2",
            table.quoted()
        );

        self.retry
            .run(&format!("watermark {}", key), || async {
                let watermark: Option<DateTime<Utc>> = sqlx::query_scalar(&sql)
                    .bind(&key.source_id)
                    .bind(&key.entity_id)
                    .fetch_one(&self.pool)
                    .await?;
                Ok::<_, GatewayError>(watermark)
            })
            .await
    }

    async fn batch_upsert(&self, rows: &[NormalizedRecord], table: &TableName) -> GatewayResult<u64> {
        let Some(mut staged) = StagedBatch::write(rows)? else {
            return Ok(0);
        };
        let columns = staged.columns();
        let payload = staged.read_bytes()?;

        let written = self
            .retry
            .run(&format!("upsert {}", table), || {
                self.replace_staged(table, &columns, &payload)
            })
            .await?;

        debug!(table = %table, rows = staged.rows(), written, "Batch upserted");
        Ok(written)
    }

    async fn compact(
        &self,
        table: &TableName,
        key_columns: &[&str],
        tie_break_column: &str,
    ) -> GatewayResult<CompactionStats> {
        for column in key_columns {
            validate_identifier(column)?;
        }
        validate_identifier(tie_break_column)?;

        let stats = self
            .retry
            .run(&format!("compact {}", table), || {
                self.compact_once(table, key_columns, tie_break_column)
            })
            .await?;

        info!(
            table = %table,
            rows_before = stats.rows_before,
            rows_after = stats.rows_after,
            removed = stats.removed(),
            "Compaction complete"
        );
        Ok(stats)
    }

    async fn series_timestamps(
        &self,
        key: &WatermarkKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> GatewayResult<Vec<DateTime<Utc>>> {
        let table = self.table_for(key.kind, key.interval)?;
        let sql = format!(
            "SELECT DISTINCT \"{TIMESTAMP_COLUMN}\" FROM {} \
             WHERE \"{SOURCE_COLUMN}\" = $1 AND \"{ENTITY_COLUMN}\" = $2 \
             AND \"{TIMESTAMP_COLUMN}\" BETWEEN $3 AND $4 \
             ORDER BY \"{TIMESTAMP_COLUMN}\"",
            table.quoted()
        );

        self.retry
            .run(&format!("timestamps {}", key), || async {
                let stamps: Vec<DateTime<Utc>> = sqlx::query_scalar(&sql)
                    .bind(&key.source_id)
                    .bind(&key.entity_id)
                    .bind(start)
                    .bind(end)
                    .fetch_all(&self.pool)
                    .await?;
                Ok::<_, GatewayError>(stamps)
            })
            .await
    }
}
