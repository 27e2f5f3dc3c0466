use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use taskhub_core::{JobId, JobRecord};

/// Ledger operation error.
///
/// These are **infrastructure errors**. A duplicate `begin` is not an error:
/// it is reported as `false` by [`JobLedger::insert_in_progress`].
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The store cannot be reached (pool closed, timed out, network).
    /// Nothing was written.
    #[error("ledger store unavailable: {0}")]
    Unavailable(String),

    /// A stored row violates the ledger data model.
    #[error("corrupt ledger record: {0}")]
    Corrupt(String),

    /// Any other storage failure reported by the engine.
    #[error("ledger storage error: {0}")]
    Store(String),
}

impl LedgerError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// Per-status record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub in_progress: u64,
    pub completed: u64,
}

impl LedgerStats {
    pub fn total(&self) -> u64 {
        self.in_progress + self.completed
    }
}

/// Durable job ledger: one record per logical job id.
///
/// The two write primitives must be implemented with the storage engine's
/// native atomic conditional write (never read-then-write in application
/// code), otherwise racing invocations reintroduce duplicate side effects.
///
/// ## Write Semantics
///
/// `insert_in_progress()`:
/// - inserts `{status: in_progress, created_at: now}` only when no record exists
/// - never overwrites an existing record (its `created_at` survives)
/// - returns `true` when this call created the record
///
/// `upsert_completed()`:
/// - creates a completed record when none exists (no prior `begin` required)
/// - moves an `in_progress` record to `completed`
/// - leaves an already completed record untouched (first result wins)
/// - returns `true` when this call wrote the result
///
/// Only the idempotency gate calls the write primitives.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Result of a completed job; `None` for missing or in-progress jobs.
    async fn find_completed(&self, job_id: &JobId) -> Result<Option<JsonValue>, LedgerError>;

    /// Insert-if-absent of an in-progress record.
    async fn insert_in_progress(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Atomic completion upsert.
    async fn upsert_completed(
        &self,
        job_id: &JobId,
        result: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Full record, for diagnostics.
    async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, LedgerError>;

    /// In-progress records created before `older_than`, oldest first.
    async fn list_stale_in_progress(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, LedgerError>;

    /// Record counts per status.
    async fn stats(&self) -> Result<LedgerStats, LedgerError>;
}

#[async_trait]
impl<L> JobLedger for Arc<L>
where
    L: JobLedger + ?Sized,
{
    async fn find_completed(&self, job_id: &JobId) -> Result<Option<JsonValue>, LedgerError> {
        (**self).find_completed(job_id).await
    }

    async fn insert_in_progress(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        (**self).insert_in_progress(job_id, now).await
    }

    async fn upsert_completed(
        &self,
        job_id: &JobId,
        result: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        (**self).upsert_completed(job_id, result, now).await
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, LedgerError> {
        (**self).get(job_id).await
    }

    async fn list_stale_in_progress(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, LedgerError> {
        (**self).list_stale_in_progress(older_than, limit).await
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        (**self).stats().await
    }
}
