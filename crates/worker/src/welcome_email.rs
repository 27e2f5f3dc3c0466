//! Welcome email sent once per newly registered user.
//!
//! The producer enqueues with the user id as business key, so a retried
//! registration request or a redelivered message never mails twice. Ledger
//! keys are `welcome_email:<user id>`, the form existing `job_log` rows use.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tracing::info;

use taskhub_core::{JobId, UserId};
use taskhub_infra::jobs::{DispatchError, JobDispatcher, JobExecutor, JobHandler, JobLedger};
use taskhub_infra::transport::JobTransport;

pub const TASK_NAME: &str = "taskhub.send_welcome_email";

/// Prefix of the welcome email's job ids in the ledger.
pub const JOB_ID_PREFIX: &str = "welcome_email";

/// Ledger key of the welcome email for `user_id`.
pub fn job_id_for(user_id: UserId) -> Result<JobId, DispatchError> {
    Ok(JobId::derive(JOB_ID_PREFIX, &user_id.to_string())?)
}

/// Outbound mail delivery.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_welcome(&self, email: &str) -> anyhow::Result<()>;
}

/// Mailer that only logs the send.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_welcome(&self, email: &str) -> anyhow::Result<()> {
        info!(email, "sending welcome email");
        Ok(())
    }
}

/// Handler for [`TASK_NAME`]. Args: `[email]`.
#[derive(Debug, Clone)]
pub struct WelcomeEmailHandler<M> {
    mailer: M,
}

impl<M> WelcomeEmailHandler<M> {
    pub fn new(mailer: M) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl<M> JobHandler for WelcomeEmailHandler<M>
where
    M: Mailer,
{
    async fn handle(&self, args: Vec<JsonValue>) -> anyhow::Result<JsonValue> {
        let email = match args.first().and_then(JsonValue::as_str) {
            Some(email) if !email.trim().is_empty() => email,
            _ => anyhow::bail!("expected [email] arguments, got {}", JsonValue::Array(args.clone())),
        };

        self.mailer.send_welcome(email).await?;

        Ok(json!({
            "status": "sent",
            "email": email,
            "processed_at": Utc::now().to_rfc3339(),
        }))
    }
}

/// Register the welcome email handler on `executor`.
pub fn register<L, M>(executor: &mut JobExecutor<L>, mailer: M)
where
    L: JobLedger,
    M: Mailer + 'static,
{
    executor.register_handler(TASK_NAME, WelcomeEmailHandler::new(mailer));
}

/// Enqueue the welcome email for a newly registered user.
pub async fn enqueue_welcome_email<T>(
    dispatcher: &JobDispatcher<T>,
    user_id: UserId,
    email: &str,
) -> Result<JobId, DispatchError>
where
    T: JobTransport,
{
    dispatcher
        .dispatch_with_id(TASK_NAME, job_id_for(user_id)?, vec![json!(email)])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use taskhub_infra::jobs::{ExecuteError, InMemoryJobLedger};
    use taskhub_infra::transport::{DeliverySource, InMemoryTransport};

    #[derive(Debug, Default)]
    struct CountingMailer {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Mailer for Arc<CountingMailer> {
        async fn send_welcome(&self, _email: &str) -> anyhow::Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_reports_sent_email() {
        let handler = WelcomeEmailHandler::new(LogMailer);
        let result = handler
            .handle(vec![json!("new@example.com")])
            .await
            .unwrap();

        assert_eq!(result["status"], json!("sent"));
        assert_eq!(result["email"], json!("new@example.com"));
        let processed_at = result["processed_at"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(processed_at).is_ok());
    }

    #[tokio::test]
    async fn invalid_args_are_a_work_failure() {
        let handler = WelcomeEmailHandler::new(LogMailer);
        assert!(handler.handle(vec![]).await.is_err());
        assert!(handler.handle(vec![json!(7)]).await.is_err());
        assert!(handler.handle(vec![json!("  ")]).await.is_err());
    }

    #[tokio::test]
    async fn enqueue_uses_user_id_as_business_key() {
        let transport = InMemoryTransport::default();
        let dispatcher = JobDispatcher::new(transport.clone());
        let user = UserId::new();

        let job_id = enqueue_welcome_email(&dispatcher, user, "u@example.com")
            .await
            .unwrap();
        assert_eq!(job_id.as_str(), format!("welcome_email:{user}"));
        assert_eq!(job_id, job_id_for(user).unwrap());

        let delivery = transport
            .receive(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.task_name, TASK_NAME);
        assert_eq!(delivery.message.job_id, job_id);
        assert_eq!(delivery.message.args, vec![json!("u@example.com")]);
    }

    #[tokio::test]
    async fn repeated_delivery_mails_once() {
        let mailer = Arc::new(CountingMailer::default());
        let mut executor = JobExecutor::new(InMemoryJobLedger::arc());
        register(&mut executor, mailer.clone());

        let transport = InMemoryTransport::default();
        let dispatcher = JobDispatcher::new(transport.clone());
        let user = UserId::new();
        enqueue_welcome_email(&dispatcher, user, "u@example.com")
            .await
            .unwrap();
        enqueue_welcome_email(&dispatcher, user, "u@example.com")
            .await
            .unwrap();

        let mut results = Vec::new();
        while let Some(delivery) = transport
            .receive(Duration::from_millis(20))
            .await
            .unwrap()
        {
            results.push(executor.execute(&delivery.message).await.unwrap().result);
            transport.ack(&delivery).await.unwrap();
        }

        assert_eq!(results.len(), 2);
        assert_eq!(results[0], results[1]);
        assert_eq!(mailer.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_executor_rejects_task() {
        let executor = JobExecutor::new(InMemoryJobLedger::arc());
        let dispatcher = JobDispatcher::new(InMemoryTransport::default());
        let job_id = enqueue_welcome_email(&dispatcher, UserId::new(), "x@example.com")
            .await
            .unwrap();

        let message = taskhub_core::JobMessage::new(TASK_NAME, vec![json!("x@example.com")], job_id);
        assert!(matches!(
            executor.execute(&message).await,
            Err(ExecuteError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn existing_ledger_row_is_replayed_without_mailing() {
        let ledger = InMemoryJobLedger::arc();
        let user = UserId::new();
        let stored = json!({"status": "sent", "email": "old@example.com"});
        let existing = JobId::parse(format!("welcome_email:{user}")).unwrap();
        ledger
            .upsert_completed(&existing, &stored, Utc::now())
            .await
            .unwrap();

        let mailer = Arc::new(CountingMailer::default());
        let mut executor = JobExecutor::new(ledger);
        register(&mut executor, mailer.clone());

        let transport = InMemoryTransport::default();
        let dispatcher = JobDispatcher::new(transport.clone());
        enqueue_welcome_email(&dispatcher, user, "old@example.com")
            .await
            .unwrap();
        let delivery = transport
            .receive(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        let execution = executor.execute(&delivery.message).await.unwrap();
        assert!(execution.replayed);
        assert_eq!(execution.result, stored);
        assert_eq!(mailer.sent.load(Ordering::SeqCst), 0);
    }
}
