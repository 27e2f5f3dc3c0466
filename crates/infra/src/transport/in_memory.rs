use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use taskhub_core::JobMessage;

use super::{Delivery, DeliverySource, JobTransport, NackOutcome, TransportError};
use crate::jobs::types::{DeadLetterEntry, RetryPolicy};

#[derive(Debug, Clone)]
struct Envelope {
    message: JobMessage,
    /// Deliveries made so far.
    deliveries: u32,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<String, Envelope>,
    /// Nacked messages waiting out their backoff delay.
    delayed: usize,
    dead_letters: Vec<DeadLetterEntry>,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    next_id: AtomicU64,
    retry_policy: RetryPolicy,
}

/// In-process transport.
///
/// Intended for tests/dev. Cloning yields another handle to the same queue, so
/// one clone can back the dispatcher while another feeds a worker.
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl InMemoryTransport {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
                retry_policy,
            }),
        }
    }

    /// Redeliver a message as if the broker lost its acknowledgement.
    pub fn redeliver(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let envelope = state
            .in_flight
            .remove(&delivery.delivery_id)
            .unwrap_or_else(|| Envelope {
                message: delivery.message.clone(),
                deliveries: delivery.attempt,
            });
        state.ready.push_back(envelope);
        drop(state);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Stop accepting and handing out messages.
    pub fn close(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.closed = true;
        }
        self.inner.notify.notify_waiters();
    }

    /// Messages ready for delivery.
    pub fn ready_len(&self) -> usize {
        self.inner.state.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Delivered but not yet acked/nacked.
    pub fn in_flight_len(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|s| s.in_flight.len())
            .unwrap_or(0)
    }

    /// True when nothing is ready, in flight or waiting for a retry.
    pub fn is_idle(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| s.ready.is_empty() && s.in_flight.is_empty() && s.delayed == 0)
            .unwrap_or(false)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.inner
            .state
            .lock()
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, TransportError> {
        self.inner
            .state
            .lock()
            .map_err(|_| TransportError::Command("lock poisoned".to_string()))
    }

    fn try_take(&self) -> Result<Option<Delivery>, TransportError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(TransportError::Closed);
        }
        let Some(mut envelope) = state.ready.pop_front() else {
            return Ok(None);
        };
        envelope.deliveries += 1;
        let delivery_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let delivery = Delivery {
            delivery_id: delivery_id.clone(),
            message: envelope.message.clone(),
            attempt: envelope.deliveries,
        };
        state.in_flight.insert(delivery_id, envelope);
        Ok(Some(delivery))
    }
}

#[async_trait]
impl JobTransport for InMemoryTransport {
    async fn submit(&self, message: JobMessage) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.ready.push_back(Envelope {
            message,
            deliveries: 0,
        });
        drop(state);
        self.inner.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl DeliverySource for InMemoryTransport {
    async fn receive(&self, max_wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + max_wait;
        loop {
            // Register interest before checking so a concurrent submit is not missed.
            let notified = self.inner.notify.notified();
            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        match state.in_flight.remove(&delivery.delivery_id) {
            Some(_) => Ok(()),
            None => Err(TransportError::Command(format!(
                "unknown delivery {}",
                delivery.delivery_id
            ))),
        }
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<NackOutcome, TransportError> {
        let policy = &self.inner.retry_policy;
        let mut state = self.lock()?;
        let envelope = state.in_flight.remove(&delivery.delivery_id).ok_or_else(|| {
            TransportError::Command(format!("unknown delivery {}", delivery.delivery_id))
        })?;

        if !policy.should_retry(envelope.deliveries) {
            warn!(
                job_id = %envelope.message.job_id,
                attempts = envelope.deliveries,
                reason,
                "retries exhausted; message dead-lettered"
            );
            state.dead_letters.push(DeadLetterEntry::new(
                envelope.message,
                envelope.deliveries,
                reason,
            ));
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = policy.delay_for_attempt(envelope.deliveries);
        debug!(
            job_id = %envelope.message.job_id,
            attempt = envelope.deliveries,
            delay_ms = delay.as_millis() as u64,
            "message scheduled for redelivery"
        );

        if delay.is_zero() {
            state.ready.push_back(envelope);
            drop(state);
            self.inner.notify.notify_one();
        } else {
            state.delayed += 1;
            drop(state);
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Ok(mut state) = inner.state.lock() {
                    state.delayed -= 1;
                    state.ready.push_back(envelope);
                }
                inner.notify.notify_one();
            });
        }

        Ok(NackOutcome::Retrying { delay })
    }
}
