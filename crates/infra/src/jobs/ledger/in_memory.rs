use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use taskhub_core::{JobId, JobRecord, JobStatus};

use super::r#trait::{JobLedger, LedgerError, LedgerStats};

/// In-memory job ledger.
///
/// Intended for tests/dev. Each write primitive runs inside a single write-lock
/// critical section, which gives the same atomicity as the database's
/// conditional writes.
#[derive(Debug, Default)]
pub struct InMemoryJobLedger {
    records: RwLock<HashMap<JobId, JobRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate a store outage: every call fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("in-memory ledger offline".to_string()));
        }
        Ok(())
    }

    fn poisoned() -> LedgerError {
        LedgerError::Unavailable("lock poisoned".to_string())
    }
}

#[async_trait]
impl JobLedger for InMemoryJobLedger {
    async fn find_completed(&self, job_id: &JobId) -> Result<Option<JsonValue>, LedgerError> {
        self.check_available()?;
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records
            .get(job_id)
            .and_then(|r| r.completed_result())
            .cloned())
    }

    async fn insert_in_progress(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.check_available()?;
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        if records.contains_key(job_id) {
            return Ok(false);
        }
        records.insert(job_id.clone(), JobRecord::in_progress(job_id.clone(), now));
        Ok(true)
    }

    async fn upsert_completed(
        &self,
        job_id: &JobId,
        result: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.check_available()?;
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        match records.get_mut(job_id) {
            Some(record) => Ok(record.complete(result.clone(), now)),
            None => {
                records.insert(
                    job_id.clone(),
                    JobRecord::completed(job_id.clone(), result.clone(), now),
                );
                Ok(true)
            }
        }
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, LedgerError> {
        self.check_available()?;
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.get(job_id).cloned())
    }

    async fn list_stale_in_progress(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, LedgerError> {
        self.check_available()?;
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        let mut stale: Vec<JobRecord> = records
            .values()
            .filter(|r| r.status == JobStatus::InProgress && r.created_at < older_than)
            .cloned()
            .collect();
        stale.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        stale.truncate(limit);
        Ok(stale)
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        self.check_available()?;
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        let mut stats = LedgerStats::default();
        for record in records.values() {
            match record.status {
                JobStatus::InProgress => stats.in_progress += 1,
                JobStatus::Completed => stats.completed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn job(key: &str) -> JobId {
        JobId::derive("job", key).unwrap()
    }

    #[tokio::test]
    async fn insert_in_progress_keeps_first_created_at() {
        let ledger = InMemoryJobLedger::new();
        let id = job("abc");
        let t0 = Utc::now();

        assert!(ledger.insert_in_progress(&id, t0).await.unwrap());
        assert!(!ledger
            .insert_in_progress(&id, t0 + Duration::seconds(5))
            .await
            .unwrap());

        let record = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::InProgress);
        assert_eq!(record.created_at, t0);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_create_one_record() {
        let ledger = InMemoryJobLedger::arc();
        let id = job("race");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                ledger.insert_in_progress(&id, Utc::now()).await.unwrap()
            }));
        }

        let mut created = 0;
        for h in handles {
            if h.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn first_completion_wins() {
        let ledger = InMemoryJobLedger::new();
        let id = job("abc");
        let now = Utc::now();

        ledger.insert_in_progress(&id, now).await.unwrap();
        assert!(ledger
            .upsert_completed(&id, &json!({"n": 1}), now)
            .await
            .unwrap());
        assert!(!ledger
            .upsert_completed(&id, &json!({"n": 2}), now + Duration::seconds(1))
            .await
            .unwrap());
        assert!(!ledger.insert_in_progress(&id, now).await.unwrap());

        assert_eq!(
            ledger.find_completed(&id).await.unwrap(),
            Some(json!({"n": 1}))
        );
        let record = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(record.updated_at, Some(now));
    }

    #[tokio::test]
    async fn completion_without_begin_creates_valid_record() {
        let ledger = InMemoryJobLedger::new();
        let id = job("no-begin");
        let now = Utc::now();

        assert!(ledger
            .upsert_completed(&id, &json!("done"), now)
            .await
            .unwrap());

        let record = ledger.get(&id).await.unwrap().unwrap();
        record.validate().unwrap();
        assert_eq!(record.created_at, now);
        assert_eq!(record.updated_at, Some(now));
    }

    #[tokio::test]
    async fn in_progress_has_no_visible_result() {
        let ledger = InMemoryJobLedger::new();
        let id = job("pending");
        ledger.insert_in_progress(&id, Utc::now()).await.unwrap();
        assert_eq!(ledger.find_completed(&id).await.unwrap(), None);
        assert_eq!(ledger.find_completed(&job("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_listing_is_oldest_first_and_limited() {
        let ledger = InMemoryJobLedger::new();
        let now = Utc::now();

        ledger
            .insert_in_progress(&job("old"), now - Duration::hours(3))
            .await
            .unwrap();
        ledger
            .insert_in_progress(&job("older"), now - Duration::hours(5))
            .await
            .unwrap();
        ledger
            .insert_in_progress(&job("fresh"), now)
            .await
            .unwrap();
        ledger
            .upsert_completed(&job("done"), &json!(1), now - Duration::hours(9))
            .await
            .unwrap();

        let stale = ledger
            .list_stale_in_progress(now - Duration::hours(1), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = stale.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(ids, vec!["job:older", "job:old"]);

        let limited = ledger
            .list_stale_in_progress(now - Duration::hours(1), 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.in_progress, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total(), 4);
    }

    #[tokio::test]
    async fn outage_writes_nothing() {
        let ledger = InMemoryJobLedger::new();
        ledger.set_unavailable(true);

        let err = ledger
            .insert_in_progress(&job("x"), Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        ledger.set_unavailable(false);
        assert!(ledger.is_empty());
    }
}
