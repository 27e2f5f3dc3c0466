//! Idempotent background job execution.
//!
//! ## Components
//!
//! - `JobLedger`: durable per-job status and result (in-memory or Postgres)
//! - `IdempotencyGate`: `peek_result` / `begin` / `complete` and the
//!   execute-once protocol built on them
//! - `JobDispatcher`: producer side, derives stable job ids and submits
//! - `JobExecutor`: consumer side, runs registered handlers under the gate
//! - `RetryPolicy`: transport redelivery backoff and dead-lettering

pub mod dispatcher;
pub mod executor;
pub mod gate;
pub mod ledger;
pub mod types;

pub use dispatcher::{DispatchError, JobDispatcher};
pub use executor::{handler_fn, ExecuteError, Execution, FnHandler, JobExecutor, JobHandler};
pub use gate::{BeginOutcome, CompleteOutcome, GateError, GateOutcome, IdempotencyGate};
pub use ledger::{InMemoryJobLedger, JobLedger, LedgerError, LedgerStats, PostgresJobLedger};
pub use types::{BackoffStrategy, DeadLetterEntry, RetryPolicy};
