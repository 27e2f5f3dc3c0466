//! Execute-once protocol on top of the job ledger.
//!
//! ## Protocol
//!
//! 1. `peek_result` → a stored result is returned as-is, no side effect
//! 2. `begin` → insert-if-absent `in_progress` record
//! 3. `work()` → the side effect
//! 4. `complete` → first completed result is retained
//! 5. return the retained result
//!
//! Once a completion is visible, no later invocation runs `work` again.
//! Invocations that pass step 1 before any completion is visible may all run
//! `work` (the window is not locked); `work` must tolerate that. They still
//! all return the same stored result.

use std::future::Future;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use taskhub_core::JobId;

use super::ledger::{JobLedger, LedgerError};

/// Outcome of [`IdempotencyGate::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// This call created the `in_progress` record.
    Started,
    /// A record already existed (duplicate or racing `begin`); left untouched.
    AlreadyRecorded,
}

/// Outcome of [`IdempotencyGate::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// This call stored the result.
    Recorded,
    /// A result was already stored; it was kept and this one discarded.
    AlreadyCompleted,
}

/// What [`IdempotencyGate::run`] hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    /// The job's stored result.
    pub result: JsonValue,
    /// `true` when `work` ran during this invocation.
    pub ran_work: bool,
    /// `true` when the returned result was produced by another invocation.
    pub replayed: bool,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Store(#[from] LedgerError),

    /// `work` failed; nothing was completed and the record stays `in_progress`.
    #[error("job work failed: {0}")]
    Work(#[source] anyhow::Error),
}

impl GateError {
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, GateError::Store(e) if e.is_transient())
    }
}

/// Idempotency gate over a [`JobLedger`].
#[derive(Debug, Clone)]
pub struct IdempotencyGate<L> {
    ledger: L,
}

impl<L> IdempotencyGate<L>
where
    L: JobLedger,
{
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Stored result of a completed job. `None` covers both "never started"
    /// and "in progress".
    pub async fn peek_result(&self, job_id: &JobId) -> Result<Option<JsonValue>, GateError> {
        Ok(self.ledger.find_completed(job_id).await?)
    }

    /// Ensure an `in_progress` record exists. Never fails on duplicates.
    pub async fn begin(&self, job_id: &JobId) -> Result<BeginOutcome, GateError> {
        if self.ledger.insert_in_progress(job_id, Utc::now()).await? {
            Ok(BeginOutcome::Started)
        } else {
            debug!(job_id = %job_id, "job already recorded; begin is a no-op");
            Ok(BeginOutcome::AlreadyRecorded)
        }
    }

    /// Record `result` as the job's outcome unless one is already stored.
    ///
    /// Works without a prior `begin`.
    pub async fn complete(
        &self,
        job_id: &JobId,
        result: JsonValue,
    ) -> Result<CompleteOutcome, GateError> {
        if self
            .ledger
            .upsert_completed(job_id, &result, Utc::now())
            .await?
        {
            Ok(CompleteOutcome::Recorded)
        } else {
            Ok(CompleteOutcome::AlreadyCompleted)
        }
    }

    /// Run `work` under the execute-once protocol.
    #[instrument(skip(self, work), fields(job_id = %job_id))]
    pub async fn run<F, Fut>(&self, job_id: &JobId, work: F) -> Result<GateOutcome, GateError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<JsonValue>> + Send,
    {
        if let Some(result) = self.peek_result(job_id).await? {
            info!("job already completed; returning stored result");
            return Ok(GateOutcome {
                result,
                ran_work: false,
                replayed: true,
            });
        }

        self.begin(job_id).await?;

        let computed = match work().await {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "job work failed; record left in progress");
                return Err(GateError::Work(err));
            }
        };

        match self.complete(job_id, computed.clone()).await? {
            CompleteOutcome::Recorded => Ok(GateOutcome {
                result: computed,
                ran_work: true,
                replayed: false,
            }),
            CompleteOutcome::AlreadyCompleted => {
                info!("lost completion race; returning the stored result");
                let stored = self.peek_result(job_id).await?.ok_or_else(|| {
                    LedgerError::Corrupt(format!(
                        "job {job_id} reported completed but has no stored result"
                    ))
                })?;
                Ok(GateOutcome {
                    result: stored,
                    ran_work: true,
                    replayed: true,
                })
            }
        }
    }
}
