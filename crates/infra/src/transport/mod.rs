//! Job message transports.
//!
//! A transport carries `(task_name, args, job_id)` from the dispatcher to
//! worker invocations. Delivery is **at-least-once**: a message may arrive
//! more than once, possibly concurrently. Consumers rely on the idempotency
//! gate, never on the transport, for execute-once behaviour.
//!
//! - `JobTransport`: producer side, fire-and-forget `submit`
//! - `DeliverySource`: consumer side, `receive` / `ack` / `nack`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use taskhub_core::JobMessage;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::InMemoryTransport;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConfig, RedisStreamsTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connection error: {0}")]
    Connection(String),

    #[error("transport command error: {0}")]
    Command(String),

    #[error("message serialization error: {0}")]
    Serialization(String),

    #[error("transport closed")]
    Closed,
}

/// One delivery of a job message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Transport-specific handle used for `ack`/`nack`.
    pub delivery_id: String,
    pub message: JobMessage,
    /// 1 for the first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// What the transport did with a negatively acknowledged delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Scheduled for redelivery after `delay`.
    Retrying { delay: Duration },
    /// Retry budget exhausted; moved to the dead-letter store.
    DeadLettered,
}

/// Producer side of a transport.
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Hand a message to the transport. Returns once the transport accepted
    /// it; never waits for execution.
    async fn submit(&self, message: JobMessage) -> Result<(), TransportError>;
}

/// Consumer side of a transport.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Wait up to `max_wait` for the next delivery. `Ok(None)` on timeout.
    async fn receive(&self, max_wait: Duration) -> Result<Option<Delivery>, TransportError>;

    /// The delivery was handled; do not redeliver it.
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// The delivery failed; apply the retry policy.
    async fn nack(&self, delivery: &Delivery, reason: &str)
    -> Result<NackOutcome, TransportError>;
}

#[async_trait]
impl<T> JobTransport for Arc<T>
where
    T: JobTransport + ?Sized,
{
    async fn submit(&self, message: JobMessage) -> Result<(), TransportError> {
        (**self).submit(message).await
    }
}

#[async_trait]
impl<T> DeliverySource for Arc<T>
where
    T: DeliverySource + ?Sized,
{
    async fn receive(&self, max_wait: Duration) -> Result<Option<Delivery>, TransportError> {
        (**self).receive(max_wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        (**self).ack(delivery).await
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<NackOutcome, TransportError> {
        (**self).nack(delivery, reason).await
    }
}
