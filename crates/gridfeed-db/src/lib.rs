//! Postgres-backed implementations of the gridfeed storage contracts.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use gridfeed_core::{
    format_canonical_timestamp, parse_canonical_timestamp, Destination, IngestLedger,
    IngestStatus, LedgerError, LoadError, ReportSpec, RunLogError, RunRecorder, RunStatus,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gridfeed-db";

/// Ledger, run-log, and destination DDL (embedded).
const SCHEMA: &str = include_str!("schema.sql");

/// Postgres limits one statement to u16::MAX bind parameters.
fn max_rows_per_insert(column_count: usize) -> usize {
    (u16::MAX as usize / column_count.max(1)).clamp(1, 500)
}

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Multi-row `INSERT INTO <table> (cols...) VALUES ...` with `$n`
/// placeholders. Identifiers come from a [`ReportSpec`] validated at
/// startup.
fn insert_statement(spec: &ReportSpec, row_count: usize) -> String {
    let columns = spec.allowed_columns.join(", ");
    let width = spec.allowed_columns.len();
    let mut groups = Vec::with_capacity(row_count);
    for row in 0..row_count {
        let placeholders: Vec<String> = (0..width)
            .map(|col| format!("${}", row * width + col + 1))
            .collect();
        groups.push(format!("({})", placeholders.join(", ")));
    }
    format!(
        "INSERT INTO {} ({columns}) VALUES {}",
        spec.report_type,
        groups.join(", ")
    )
}

/// Shared Postgres store behind the [`IngestLedger`], [`RunRecorder`] and
/// [`Destination`] contracts. Cloning is cheap, the pool is shared.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl IngestLedger for PgStore {
    async fn already_ingested(
        &self,
        archive_id: &str,
        report_type: &str,
    ) -> Result<bool, LedgerError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                 SELECT 1 FROM archive_ingest_log
                 WHERE archive_id = $1 AND report_type = $2
             )",
        )
        .bind(archive_id)
        .bind(report_type)
        .fetch_one(&self.pool)
        .await
        .map_err(LedgerError::backend)?;
        Ok(exists)
    }

    async fn log_status(
        &self,
        archive_id: &str,
        report_type: &str,
        status: IngestStatus,
        notes: Option<&str>,
    ) -> Result<(), LedgerError> {
        // Insert-if-absent: ledger entries are terminal, a repeat is a no-op.
        sqlx::query(
            "INSERT INTO archive_ingest_log (archive_id, report_type, status, notes)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (archive_id, report_type) DO NOTHING",
        )
        .bind(archive_id)
        .bind(report_type)
        .bind(status.as_str())
        .bind(notes)
        .execute(&self.pool)
        .await
        .map_err(LedgerError::backend)?;
        Ok(())
    }
}

#[async_trait]
impl RunRecorder for PgStore {
    async fn start(&self, report_type: &str) -> Result<Uuid, RunLogError> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO pipeline_run_log (run_id, report_type, status, started_at)
             VALUES ($1, $2, $3, now())",
        )
        .bind(run_id)
        .bind(report_type)
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .map_err(RunLogError::backend)?;
        debug!(%run_id, report_type, "pipeline run started");
        Ok(run_id)
    }

    async fn finish(
        &self,
        run_id: Uuid,
        status: RunStatus,
        notes: Option<&str>,
    ) -> Result<(), RunLogError> {
        let result = sqlx::query(
            "UPDATE pipeline_run_log
             SET status = $2, notes = $3, ended_at = now()
             WHERE run_id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(notes)
        .execute(&self.pool)
        .await
        .map_err(RunLogError::backend)?;
        if result.rows_affected() == 0 {
            return Err(RunLogError::NotRunning(run_id));
        }
        debug!(%run_id, status = status.as_str(), "pipeline run finalized");
        Ok(())
    }
}

#[async_trait]
impl Destination for PgStore {
    async fn existing_keys(&self, spec: &ReportSpec) -> Result<HashSet<Vec<String>>, LoadError> {
        let sql = format!(
            "SELECT DISTINCT {} FROM {}",
            spec.key_columns.join(", "),
            spec.report_type
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(LoadError::backend)?;

        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            let mut tuple = Vec::with_capacity(spec.key_columns.len());
            for (index, column) in spec.key_columns.iter().enumerate() {
                let value = if spec.datetime_columns.contains(column) {
                    row.try_get::<Option<NaiveDateTime>, _>(index)
                        .map_err(LoadError::backend)?
                        .map(format_canonical_timestamp)
                        .unwrap_or_default()
                } else {
                    row.try_get::<Option<String>, _>(index)
                        .map_err(LoadError::backend)?
                        .unwrap_or_default()
                };
                tuple.push(value);
            }
            keys.insert(tuple);
        }
        Ok(keys)
    }

    async fn append_rows(&self, spec: &ReportSpec, rows: &[Vec<String>]) -> Result<u64, LoadError> {
        if rows.is_empty() {
            return Ok(0);
        }

        // One transaction for the whole batch: a failed archive commits
        // nothing and stays absent from the ledger, safe to retry.
        let mut tx = self.pool.begin().await.map_err(LoadError::backend)?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(max_rows_per_insert(spec.allowed_columns.len())) {
            let sql = insert_statement(spec, chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for (column, value) in spec.allowed_columns.iter().zip(row) {
                    if spec.datetime_columns.contains(column) {
                        // Empty cells in non-key datetime columns land as NULL.
                        let ts: Option<NaiveDateTime> = if value.is_empty() {
                            None
                        } else {
                            Some(parse_canonical_timestamp(value).ok_or_else(|| {
                                LoadError::BadTimestamp {
                                    column: column.clone(),
                                    value: value.clone(),
                                }
                            })?)
                        };
                        query = query.bind(ts);
                    } else {
                        query = query.bind(value.clone());
                    }
                }
            }
            let result = query.execute(&mut *tx).await.map_err(LoadError::backend)?;
            inserted += result.rows_affected();
        }
        tx.commit().await.map_err(LoadError::backend)?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn spec() -> ReportSpec {
        ReportSpec {
            report_id: "NP4-732-CD".into(),
            report_type: "wind_hourly_forecast".into(),
            column_renames: BTreeMap::new(),
            key_columns: vec!["delivery_date".into(), "hour_ending".into()],
            datetime_columns: BTreeSet::from(["delivery_date".to_string()]),
            allowed_columns: vec![
                "delivery_date".into(),
                "hour_ending".into(),
                "system_wide_gen".into(),
            ],
        }
    }

    #[test]
    fn schema_splits_into_executable_statements() {
        let statements = schema_statements(SCHEMA);
        assert_eq!(statements.len(), 4);
        assert!(statements[0].contains("archive_ingest_log"));
        assert!(statements[1].contains("pipeline_run_log"));
        assert!(statements
            .iter()
            .all(|s| s.contains("CREATE TABLE IF NOT EXISTS")));
    }

    #[test]
    fn insert_statement_numbers_placeholders_row_major() {
        let sql = insert_statement(&spec(), 2);
        assert_eq!(
            sql,
            "INSERT INTO wind_hourly_forecast (delivery_date, hour_ending, system_wide_gen) \
             VALUES ($1, $2, $3), ($4, $5, $6)"
        );
    }

    #[test]
    fn insert_chunking_respects_postgres_parameter_limit() {
        assert_eq!(max_rows_per_insert(3), 500);
        assert_eq!(max_rows_per_insert(200), 327);
        assert_eq!(max_rows_per_insert(0), 500);
        assert!(max_rows_per_insert(usize::MAX) >= 1);
    }
}
