//! Consumer-side job execution under the idempotency gate.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use taskhub_core::{JobId, JobMessage};

use super::gate::{GateError, IdempotencyGate};
use super::ledger::{JobLedger, LedgerError};

/// Business logic for one task name.
///
/// The returned JSON becomes the job's stored result. An error means "not
/// completed": the job stays `in_progress` and a redelivery runs it again.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, args: Vec<JsonValue>) -> anyhow::Result<JsonValue>;
}

#[async_trait]
impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    async fn handle(&self, args: Vec<JsonValue>) -> anyhow::Result<JsonValue> {
        (**self).handle(args).await
    }
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Vec<JsonValue>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send,
{
    async fn handle(&self, args: Vec<JsonValue>) -> anyhow::Result<JsonValue> {
        (self.0)(args).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Vec<JsonValue>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send,
{
    FnHandler(f)
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    /// No handler registered for the message's task name. The ledger was not touched.
    #[error("no handler registered for task: {0}")]
    UnknownTask(String),

    #[error("job work failed: {0}")]
    Work(#[source] anyhow::Error),

    #[error(transparent)]
    Store(#[from] LedgerError),
}

impl From<GateError> for ExecuteError {
    fn from(value: GateError) -> Self {
        match value {
            GateError::Store(e) => ExecuteError::Store(e),
            GateError::Work(e) => ExecuteError::Work(e),
        }
    }
}

/// Result of one executor invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub job_id: JobId,
    pub result: JsonValue,
    pub ran_work: bool,
    pub replayed: bool,
}

/// Dispatches deliveries to registered handlers, each under the gate.
///
/// Holds no per-job state: every invocation coordinates through the ledger,
/// so the same message may be executed concurrently from any number of tasks
/// or processes.
pub struct JobExecutor<L> {
    gate: IdempotencyGate<L>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl<L> JobExecutor<L>
where
    L: JobLedger,
{
    pub fn new(ledger: L) -> Self {
        Self::with_gate(IdempotencyGate::new(ledger))
    }

    pub fn with_gate(gate: IdempotencyGate<L>) -> Self {
        Self {
            gate,
            handlers: HashMap::new(),
        }
    }

    pub fn gate(&self) -> &IdempotencyGate<L> {
        &self.gate
    }

    /// Register the handler for `task_name`, replacing any previous one.
    pub fn register_handler<H>(&mut self, task_name: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(task_name.into(), Arc::new(handler));
    }

    /// Register an async closure as the handler for `task_name`.
    pub fn register_fn<F, Fut>(&mut self, task_name: impl Into<String>, f: F)
    where
        F: Fn(Vec<JsonValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
    {
        self.register_handler(task_name, handler_fn(f));
    }

    pub fn has_handler(&self, task_name: &str) -> bool {
        self.handlers.contains_key(task_name)
    }

    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Execute one delivery of `message`.
    ///
    /// Safe to call any number of times, concurrently, for the same message.
    #[instrument(
        skip(self, message),
        fields(job_id = %message.job_id, task_name = %message.task_name),
        err
    )]
    pub async fn execute(&self, message: &JobMessage) -> Result<Execution, ExecuteError> {
        let Some(handler) = self.handlers.get(&message.task_name).cloned() else {
            warn!("no handler registered for task");
            return Err(ExecuteError::UnknownTask(message.task_name.clone()));
        };

        let args = message.args.clone();
        let outcome = self
            .gate
            .run(&message.job_id, move || async move { handler.handle(args).await })
            .await?;

        debug!(
            ran_work = outcome.ran_work,
            replayed = outcome.replayed,
            "job execution finished"
        );

        Ok(Execution {
            job_id: message.job_id.clone(),
            result: outcome.result,
            ran_work: outcome.ran_work,
            replayed: outcome.replayed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::jobs::ledger::InMemoryJobLedger;
    use taskhub_core::JobStatus;

    fn message(task: &str, key: &str, args: Vec<JsonValue>) -> JobMessage {
        JobMessage::new(task, args, JobId::derive(task, key).unwrap())
    }

    fn counting_executor(
        calls: Arc<AtomicUsize>,
    ) -> JobExecutor<Arc<InMemoryJobLedger>> {
        let mut executor = JobExecutor::new(InMemoryJobLedger::arc());
        executor.register_fn("email", move |args| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({"to": args[0], "send": n}))
            }
        });
        executor
    }

    #[tokio::test]
    async fn redelivery_after_success_runs_side_effect_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = counting_executor(calls.clone());
        let msg = message("email", "u1", vec![json!("a@b.c")]);

        let first = executor.execute(&msg).await.unwrap();
        let second = executor.execute(&msg).await.unwrap();
        let third = executor.execute(&msg).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(first.ran_work);
        assert!(second.replayed && third.replayed);
        assert_eq!(first.result, second.result);
        assert_eq!(first.result, third.result);
    }

    #[tokio::test]
    async fn two_business_keys_produce_two_rows() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = counting_executor(calls.clone());

        let a = executor
            .execute(&message("email", "u1", vec![json!("a@b.c")]))
            .await
            .unwrap();
        let b = executor
            .execute(&message("email", "u2", vec![json!("d@e.f")]))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_ne!(a.result, b.result);
        let stats = executor.gate().ledger().stats().await.unwrap();
        assert_eq!(stats.completed, 2);
    }

    #[tokio::test]
    async fn unknown_task_never_touches_ledger() {
        let executor = JobExecutor::new(InMemoryJobLedger::arc());
        let err = executor
            .execute(&message("nope", "k", vec![]))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecuteError::UnknownTask(ref t) if t == "nope"));
        assert!(executor.gate().ledger().is_empty());
    }

    #[tokio::test]
    async fn failure_then_retry_completes() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut executor = JobExecutor::new(InMemoryJobLedger::arc());
        let counter = attempts.clone();
        executor.register_fn("flaky", move |_args| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient failure");
                }
                Ok(json!({"status": "sent"}))
            }
        });
        let msg = message("flaky", "k", vec![]);

        let err = executor.execute(&msg).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Work(_)));
        let record = executor.gate().ledger().get(&msg.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::InProgress);

        let done = executor.execute(&msg).await.unwrap();
        assert_eq!(done.result, json!({"status": "sent"}));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_unavailable_surfaces_without_work() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = counting_executor(calls.clone());
        executor.gate().ledger().set_unavailable(true);

        let err = executor
            .execute(&message("email", "u1", vec![json!("a@b.c")]))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecuteError::Store(LedgerError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn struct_handlers_can_be_registered() {
        struct Echo;

        #[async_trait]
        impl JobHandler for Echo {
            async fn handle(&self, args: Vec<JsonValue>) -> anyhow::Result<JsonValue> {
                Ok(JsonValue::Array(args))
            }
        }

        let mut executor = JobExecutor::new(InMemoryJobLedger::arc());
        executor.register_handler("echo", Echo);
        assert!(executor.has_handler("echo"));
        assert_eq!(executor.task_names(), vec!["echo"]);

        let out = executor
            .execute(&message("echo", "k", vec![json!(1), json!(2)]))
            .await
            .unwrap();
        assert_eq!(out.result, json!([1, 2]));
    }
}
