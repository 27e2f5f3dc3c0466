//! Job ledger record and transport message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Ledger status of a job.
///
/// Persisted as the lowercase strings `in_progress` / `completed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// `begin` ran; no result recorded yet (running, retrying, or stuck).
    InProgress,
    /// A result has been recorded. Terminal.
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// One row of the job ledger.
///
/// Invariants:
/// - `result` is present iff `status == Completed`
/// - a completed record never changes again
/// - `created_at <= updated_at` when `updated_at` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Record created by the first `begin` for a job.
    pub fn in_progress(job_id: JobId, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::InProgress,
            result: None,
            created_at: now,
            updated_at: None,
        }
    }

    /// Record created by a `complete` that found no prior `begin`.
    pub fn completed(job_id: JobId, result: JsonValue, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::Completed,
            result: Some(result),
            created_at: now,
            updated_at: Some(now),
        }
    }

    /// Transition `in_progress -> completed`.
    ///
    /// Returns `false` (and leaves the record untouched) when already completed.
    pub fn complete(&mut self, result: JsonValue, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Completed;
        self.result = Some(result);
        // Clamp so a skewed worker clock cannot produce updated_at < created_at.
        self.updated_at = Some(now.max(self.created_at));
        true
    }

    /// The stored result, only when the job is completed.
    pub fn completed_result(&self) -> Option<&JsonValue> {
        match self.status {
            JobStatus::Completed => self.result.as_ref(),
            JobStatus::InProgress => None,
        }
    }

    /// Check the record against the ledger invariants.
    pub fn validate(&self) -> DomainResult<()> {
        match (self.status, &self.result) {
            (JobStatus::Completed, None) => {
                return Err(DomainError::invariant(format!(
                    "job {} is completed without a result",
                    self.job_id
                )));
            }
            (JobStatus::InProgress, Some(_)) => {
                return Err(DomainError::invariant(format!(
                    "job {} is in progress but carries a result",
                    self.job_id
                )));
            }
            _ => {}
        }

        if let Some(updated_at) = self.updated_at {
            if updated_at < self.created_at {
                return Err(DomainError::invariant(format!(
                    "job {} updated_at precedes created_at",
                    self.job_id
                )));
            }
        }

        Ok(())
    }
}

/// What the dispatcher hands to the transport and the transport delivers to
/// the executor: `(task_name, args, job_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub task_name: String,
    pub args: Vec<JsonValue>,
    pub job_id: JobId,
}

impl JobMessage {
    pub fn new(task_name: impl Into<String>, args: Vec<JsonValue>, job_id: JobId) -> Self {
        Self {
            task_name: task_name.into(),
            args,
            job_id,
        }
    }
}
