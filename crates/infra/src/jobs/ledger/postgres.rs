//! Postgres-backed job ledger.
//!
//! Persists the `job_log` table:
//!
//! ```sql
//! job_id     VARCHAR   PRIMARY KEY
//! status     VARCHAR   NOT NULL      -- 'in_progress' | 'completed'
//! result     JSON      NULL
//! created_at TIMESTAMP NOT NULL      -- UTC, no time zone
//! updated_at TIMESTAMP NULL
//! ```
//!
//! ## Atomic Writes
//!
//! `insert_in_progress` is a single `INSERT .. ON CONFLICT DO NOTHING`.
//! `upsert_completed` is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE
//! status <> 'completed'`; the affected row count tells whether this call won.
//! Neither reads before writing.
//!
//! ## Error Mapping
//!
//! | SQLx Error | LedgerError |
//! |------------|-------------|
//! | `PoolClosed`, `PoolTimedOut`, `Io`, `Tls`, `WorkerCrashed` | `Unavailable` |
//! | `ColumnDecode`, `Decode`, `ColumnNotFound`, `TypeNotFound` | `Corrupt` |
//! | `Database` (any code) and everything else | `Store` |

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};

use taskhub_core::{JobId, JobRecord, JobStatus};

use super::r#trait::{JobLedger, LedgerError, LedgerStats};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS job_log (
        job_id     VARCHAR   PRIMARY KEY,
        status     VARCHAR   NOT NULL,
        result     JSON      NULL,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NULL
    )
"#;

const CREATE_STALE_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS job_log_status_created_at_idx
    ON job_log (status, created_at)
"#;

/// Postgres job ledger.
///
/// Owns the injected pool; call [`PostgresJobLedger::close`] at shutdown.
#[derive(Debug, Clone)]
pub struct PostgresJobLedger {
    pool: PgPool,
}

impl PostgresJobLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create `job_log` and its index if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        sqlx::query(CREATE_STALE_INDEX)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        debug!("job_log schema ensured");
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl JobLedger for PostgresJobLedger {
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn find_completed(&self, job_id: &JobId) -> Result<Option<JsonValue>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT result
            FROM job_log
            WHERE job_id = $1 AND status = 'completed'
            "#,
        )
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_completed", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let result: Option<JsonValue> = row
            .try_get("result")
            .map_err(|e| map_sqlx_error("find_completed", e))?;

        match result {
            Some(result) => Ok(Some(result)),
            None => Err(LedgerError::Corrupt(format!(
                "job {job_id} is completed without a result"
            ))),
        }
    }

    #[instrument(skip(self, now), fields(job_id = %job_id), err)]
    async fn insert_in_progress(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let done = sqlx::query(
            r#"
            INSERT INTO job_log (job_id, status, result, created_at, updated_at)
            VALUES ($1, 'in_progress', NULL, $2, NULL)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id.as_str())
        .bind(now.naive_utc())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_in_progress", e))?;

        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self, result, now), fields(job_id = %job_id), err)]
    async fn upsert_completed(
        &self,
        job_id: &JobId,
        result: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let done = sqlx::query(
            r#"
            INSERT INTO job_log (job_id, status, result, created_at, updated_at)
            VALUES ($1, 'completed', $2::json, $3, $3)
            ON CONFLICT (job_id) DO UPDATE SET
                status = 'completed',
                result = EXCLUDED.result,
                updated_at = GREATEST(job_log.created_at, EXCLUDED.updated_at)
            WHERE job_log.status <> 'completed'
            "#,
        )
        .bind(job_id.as_str())
        .bind(result)
        .bind(now.naive_utc())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_completed", e))?;

        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, status, result, created_at, updated_at
            FROM job_log
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| {
            JobLogRow::from_row(&row)
                .map_err(|e| map_sqlx_error("get", e))
                .and_then(JobRecord::try_from)
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_stale_in_progress(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT job_id, status, result, created_at, updated_at
            FROM job_log
            WHERE status = 'in_progress' AND created_at < $1
            ORDER BY created_at ASC, job_id ASC
            LIMIT $2
            "#,
        )
        .bind(older_than.naive_utc())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stale_in_progress", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let row = JobLogRow::from_row(&row)
                .map_err(|e| map_sqlx_error("list_stale_in_progress", e))?;
            records.push(JobRecord::try_from(row)?);
        }
        Ok(records)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM job_log
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = LedgerStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let count = u64::try_from(count).unwrap_or(0);
            match parse_status(&status)? {
                JobStatus::InProgress => stats.in_progress = count,
                JobStatus::Completed => stats.completed = count,
            }
        }
        Ok(stats)
    }
}

#[derive(Debug)]
struct JobLogRow {
    job_id: String,
    status: String,
    result: Option<JsonValue>,
    created_at: NaiveDateTime,
    updated_at: Option<NaiveDateTime>,
}

impl<'r> FromRow<'r, PgRow> for JobLogRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobLogRow {
            job_id: row.try_get("job_id")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobLogRow> for JobRecord {
    type Error = LedgerError;

    fn try_from(row: JobLogRow) -> Result<Self, Self::Error> {
        let job_id = JobId::parse(row.job_id)
            .map_err(|e| LedgerError::Corrupt(format!("job_log.job_id: {e}")))?;
        let record = JobRecord {
            status: parse_status(&row.status)?,
            result: row.result,
            created_at: row.created_at.and_utc(),
            updated_at: row.updated_at.map(|t| t.and_utc()),
            job_id,
        };
        record
            .validate()
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
        Ok(record)
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, LedgerError> {
    JobStatus::from_str(raw).map_err(|e| LedgerError::Corrupt(format!("job_log.status: {e}")))
}

/// Map SQLx errors to ledger errors by kind.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err
                .code()
                .map(|c| c.into_owned())
                .unwrap_or_else(|| "unknown".to_string());
            LedgerError::Store(format!(
                "database error in {} (code {}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            LedgerError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(e) => LedgerError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => {
            LedgerError::Unavailable(format!("tls error in {}: {}", operation, e))
        }
        sqlx::Error::WorkerCrashed => {
            LedgerError::Unavailable(format!("connection worker crashed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => {
            LedgerError::Corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        _ => LedgerError::Store(format!("sqlx error in {}: {}", operation, err)),
    }
}
