//! `taskhub-core`: shared job vocabulary.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): job
//! identifiers, the ledger record model and the transport message shape.

pub mod error;
pub mod id;
pub mod job;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, UserId, JOB_ID_SEPARATOR};
pub use job::{JobMessage, JobRecord, JobStatus};
