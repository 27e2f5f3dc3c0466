use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::jobs::{ExecuteError, JobExecutor, JobLedger};
use crate::transport::{Delivery, DeliverySource, NackOutcome, TransportError};

/// Upper bound on concurrent executor invocations per worker.
pub const MAX_CONCURRENCY: usize = 4096;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum concurrent executor invocations, `1..=MAX_CONCURRENCY`
    pub concurrency: usize,
    /// Longest single wait on the transport before re-checking for shutdown
    pub poll_interval: Duration,
    /// Pause after a transport error
    pub error_backoff: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            concurrency: 2,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub deliveries_received: u64,
    /// Deliveries whose handler ran and whose result was stored.
    pub jobs_succeeded: u64,
    /// Deliveries answered from the ledger without running the handler.
    pub jobs_replayed: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub unknown_tasks: u64,
    pub transport_errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

type SharedStats = Arc<Mutex<WorkerStats>>;

fn record(stats: &SharedStats, f: impl FnOnce(&mut WorkerStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

/// Handle to control a running worker.
///
/// Dropping the handle also stops the worker once in-flight jobs finish.
#[derive(Debug)]
pub struct JobWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: SharedStats,
    started: Instant,
}

impl JobWorkerHandle {
    /// Stop receiving and wait for in-flight invocations to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "job worker task panicked");
            }
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }
}

/// Drives a [`DeliverySource`] into a [`JobExecutor`].
///
/// Each delivery runs in its own task, bounded by `concurrency`. A successful
/// execution (including a replayed result) is acked; any failure is nacked so
/// the transport's retry policy and dead-lettering apply.
#[derive(Debug)]
pub struct JobWorker;

impl JobWorker {
    /// Spawn the worker loop on the current tokio runtime.
    pub fn spawn<L, S>(
        executor: Arc<JobExecutor<L>>,
        source: S,
        config: JobWorkerConfig,
    ) -> JobWorkerHandle
    where
        L: JobLedger + 'static,
        S: DeliverySource + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats: SharedStats = Arc::new(Mutex::new(WorkerStats::default()));

        let join = tokio::spawn(worker_loop(
            executor,
            Arc::new(source),
            config,
            shutdown_rx,
            stats.clone(),
        ));

        JobWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
            started: Instant::now(),
        }
    }
}

async fn worker_loop<L, S>(
    executor: Arc<JobExecutor<L>>,
    source: Arc<S>,
    config: JobWorkerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: SharedStats,
) where
    L: JobLedger + 'static,
    S: DeliverySource + 'static,
{
    let concurrency = config.concurrency.clamp(1, MAX_CONCURRENCY);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    info!(worker = %config.name, concurrency, tasks = ?executor.task_names(), "job worker started");

    loop {
        let permit = tokio::select! {
            _ = shutdown_rx.changed() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = source.receive(config.poll_interval) => received,
        };

        match received {
            Ok(Some(delivery)) => {
                record(&stats, |s| {
                    s.deliveries_received += 1;
                    s.current_running += 1;
                });

                let span = tracing::info_span!(
                    "job_delivery",
                    worker = %config.name,
                    job_id = %delivery.message.job_id,
                    task_name = %delivery.message.task_name,
                    attempt = delivery.attempt
                );
                let executor = executor.clone();
                let source = source.clone();
                let stats = stats.clone();
                tokio::spawn(
                    async move {
                        handle_delivery(&*executor, &*source, &delivery, &stats).await;
                        record(&stats, |s| s.current_running = s.current_running.saturating_sub(1));
                        drop(permit);
                    }
                    .instrument(span),
                );
            }
            Ok(None) => continue,
            Err(TransportError::Closed) => {
                info!(worker = %config.name, "transport closed; stopping");
                break;
            }
            Err(err) => {
                error!(worker = %config.name, error = %err, "failed to receive job");
                record(&stats, |s| s.transport_errors += 1);
                drop(permit);
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(config.error_backoff) => {}
                }
            }
        }
    }

    // Wait for in-flight invocations.
    let permits = u32::try_from(concurrency).unwrap_or(u32::MAX);
    let _ = semaphore.acquire_many(permits).await;
    info!(worker = %config.name, "job worker stopped");
}

async fn handle_delivery<L, S>(
    executor: &JobExecutor<L>,
    source: &S,
    delivery: &Delivery,
    stats: &SharedStats,
) where
    L: JobLedger,
    S: DeliverySource + ?Sized,
{
    match executor.execute(&delivery.message).await {
        Ok(execution) => {
            record(stats, |s| {
                if execution.ran_work && !execution.replayed {
                    s.jobs_succeeded += 1;
                } else {
                    s.jobs_replayed += 1;
                }
            });
            if let Err(err) = source.ack(delivery).await {
                error!(error = %err, "failed to ack delivery");
                record(stats, |s| s.transport_errors += 1);
            }
        }
        Err(err) => {
            let unknown = matches!(err, ExecuteError::UnknownTask(_));
            record(stats, |s| {
                s.jobs_failed += 1;
                if unknown {
                    s.unknown_tasks += 1;
                }
            });

            match source.nack(delivery, &err.to_string()).await {
                Ok(NackOutcome::DeadLettered) => {
                    warn!(error = %err, "job dead-lettered");
                    record(stats, |s| s.jobs_dead_lettered += 1);
                }
                Ok(NackOutcome::Retrying { delay }) => {
                    debug!(
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "job failed; redelivery scheduled"
                    );
                }
                Err(nack_err) => {
                    error!(error = %err, nack_error = %nack_err, "failed to nack delivery");
                    record(stats, |s| s.transport_errors += 1);
                }
            }
        }
    }
}
