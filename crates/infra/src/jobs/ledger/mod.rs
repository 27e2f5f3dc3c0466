//! Durable job ledger boundary.
//!
//! One record per logical job id, holding its status and (once completed) its
//! result. The idempotency gate is the only writer.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobLedger;
pub use postgres::PostgresJobLedger;
pub use r#trait::{JobLedger, LedgerError, LedgerStats};
