//! `taskhub-worker`: the worker process and the tasks it serves.

pub mod welcome_email;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use taskhub_infra::jobs::{JobLedger, LedgerError};

/// In-progress rows older than this are reported as stuck.
pub const STALE_AFTER_SECS: i64 = 60 * 60;

const STALE_REPORT_LIMIT: usize = 20;

/// Log ledger row counts and any job stuck in progress.
///
/// Returns the number of stale jobs found (capped at the report limit).
pub async fn report_ledger_health<L>(ledger: &L) -> Result<usize, LedgerError>
where
    L: JobLedger,
{
    let stats = ledger.stats().await?;
    info!(
        in_progress = stats.in_progress,
        completed = stats.completed,
        total = stats.total(),
        "job ledger stats"
    );

    let older_than = Utc::now() - Duration::seconds(STALE_AFTER_SECS);
    let stale = ledger
        .list_stale_in_progress(older_than, STALE_REPORT_LIMIT)
        .await?;
    for record in &stale {
        warn!(
            job_id = %record.job_id,
            created_at = %record.created_at,
            "job stuck in progress"
        );
    }
    Ok(stale.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskhub_core::JobId;
    use taskhub_infra::jobs::InMemoryJobLedger;

    #[tokio::test]
    async fn reports_only_old_in_progress_jobs() {
        let ledger = InMemoryJobLedger::new();
        let long_ago = Utc::now() - Duration::hours(3);

        let stuck = JobId::derive("welcome_email", "stuck").unwrap();
        let fresh = JobId::derive("welcome_email", "fresh").unwrap();
        let done = JobId::derive("welcome_email", "done").unwrap();

        ledger.insert_in_progress(&stuck, long_ago).await.unwrap();
        ledger.insert_in_progress(&fresh, Utc::now()).await.unwrap();
        ledger.insert_in_progress(&done, long_ago).await.unwrap();
        ledger
            .upsert_completed(&done, &json!({"status": "sent"}), long_ago)
            .await
            .unwrap();

        assert_eq!(report_ledger_health(&ledger).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unavailable_ledger_is_an_error() {
        let ledger = InMemoryJobLedger::new();
        ledger.set_unavailable(true);
        assert!(report_ledger_health(&ledger).await.is_err());
    }
}
