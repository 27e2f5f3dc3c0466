//! Producer-side job submission.
//!
//! ## Dispatch Flow
//!
//! ```text
//! (task_name, business_key, args)
//!   ↓
//! 1. Derive job_id = task_name ":" business_key (deterministic)
//!   ↓
//! 2. Build JobMessage { task_name, args, job_id }
//!   ↓
//! 3. Submit to the transport (fire-and-forget)
//! ```
//!
//! The job id is what makes redelivery and re-dispatch harmless: dispatching
//! the same business identity twice yields the same id, and the worker-side
//! gate executes it at most once.
//!
//! The dispatcher never waits for execution and never retries a failed
//! submission; the error goes back to the caller once.

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, instrument, warn};

use taskhub_core::{DomainError, JobId, JobMessage};

use crate::transport::{JobTransport, TransportError};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Empty task name or business key. Nothing was submitted.
    #[error("invalid job: {0}")]
    Validation(String),

    /// The transport refused or failed to accept the message.
    #[error("job submission failed: {0}")]
    Transport(#[from] TransportError),
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg)
            | DomainError::InvalidId(msg)
            | DomainError::InvariantViolation(msg) => DispatchError::Validation(msg),
        }
    }
}

/// Submits jobs keyed by business identity.
#[derive(Debug, Clone)]
pub struct JobDispatcher<T> {
    transport: T,
}

impl<T> JobDispatcher<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T> JobDispatcher<T>
where
    T: JobTransport,
{
    /// Submit `task_name` for `business_key` and return the derived job id.
    ///
    /// Returns as soon as the transport accepted the message.
    #[instrument(skip(self, args), fields(task_name = %task_name, business_key = %business_key), err)]
    pub async fn dispatch(
        &self,
        task_name: &str,
        business_key: &str,
        args: Vec<JsonValue>,
    ) -> Result<JobId, DispatchError> {
        let job_id = JobId::derive(task_name, business_key)?;
        self.dispatch_with_id(task_name, job_id, args).await
    }

    /// Submit `task_name` under an already derived `job_id`.
    ///
    /// For producers whose ledger keys use a prefix other than the task name.
    #[instrument(skip(self, args), fields(task_name = %task_name, job_id = %job_id), err)]
    pub async fn dispatch_with_id(
        &self,
        task_name: &str,
        job_id: JobId,
        args: Vec<JsonValue>,
    ) -> Result<JobId, DispatchError> {
        if task_name.trim().is_empty() {
            return Err(DispatchError::Validation("task name must not be empty".into()));
        }
        let message = JobMessage::new(task_name, args, job_id.clone());

        if let Err(err) = self.transport.submit(message).await {
            warn!(job_id = %job_id, error = %err, "job submission failed");
            return Err(err.into());
        }

        info!(job_id = %job_id, "job dispatched");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::transport::{DeliverySource, InMemoryTransport};

    #[tokio::test]
    async fn dispatch_submits_message_with_derived_id() {
        let transport = InMemoryTransport::default();
        let dispatcher = JobDispatcher::new(transport.clone());

        let job_id = dispatcher
            .dispatch("welcome_email", "user_7", vec![json!("a@example.com")])
            .await
            .unwrap();
        assert_eq!(job_id.as_str(), "welcome_email:user_7");

        let delivery = transport
            .receive(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.task_name, "welcome_email");
        assert_eq!(delivery.message.args, vec![json!("a@example.com")]);
        assert_eq!(delivery.message.job_id, job_id);
    }

    #[tokio::test]
    async fn same_business_key_yields_same_job_id() {
        let dispatcher = JobDispatcher::new(InMemoryTransport::default());
        let a = dispatcher.dispatch("t", "k", vec![]).await.unwrap();
        let b = dispatcher.dispatch("t", "k", vec![]).await.unwrap();
        let c = dispatcher.dispatch("t", "other", vec![]).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(dispatcher.transport().ready_len(), 3);
    }

    #[tokio::test]
    async fn blank_identity_is_rejected_before_submission() {
        let dispatcher = JobDispatcher::new(InMemoryTransport::default());

        assert!(matches!(
            dispatcher.dispatch("", "k", vec![]).await,
            Err(DispatchError::Validation(_))
        ));
        assert!(matches!(
            dispatcher.dispatch("t", " ", vec![]).await,
            Err(DispatchError::Validation(_))
        ));
        assert_eq!(dispatcher.transport().ready_len(), 0);
    }

    #[tokio::test]
    async fn explicit_job_id_is_kept() {
        let transport = InMemoryTransport::default();
        let dispatcher = JobDispatcher::new(transport.clone());
        let job_id = JobId::derive("welcome_email", "user_7").unwrap();

        let returned = dispatcher
            .dispatch_with_id("taskhub.send_welcome_email", job_id.clone(), vec![])
            .await
            .unwrap();
        assert_eq!(returned, job_id);

        let delivery = transport
            .receive(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.task_name, "taskhub.send_welcome_email");
        assert_eq!(delivery.message.job_id.as_str(), "welcome_email:user_7");

        assert!(matches!(
            dispatcher.dispatch_with_id(" ", job_id, vec![]).await,
            Err(DispatchError::Validation(_))
        ));
        assert_eq!(transport.ready_len(), 0);
    }

    #[tokio::test]
    async fn transport_failure_is_returned_once() {
        let transport = InMemoryTransport::default();
        transport.close();
        let dispatcher = JobDispatcher::new(transport);

        let err = dispatcher.dispatch("t", "k", vec![]).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport(TransportError::Closed)));
    }
}
