//! Background workers.

pub mod job_worker;

pub use job_worker::{JobWorker, JobWorkerConfig, JobWorkerHandle, WorkerStats, MAX_CONCURRENCY};
