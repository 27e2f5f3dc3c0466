//! Errors raised by the pure job model.

use thiserror::Error;

/// Result alias for fallible core operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failure of a core value or record.
///
/// Ledger and transport failures have their own error types in `taskhub-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Rejected input, such as a blank task name or an unknown status string.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A ledger record breaks the status/result/timestamp rules.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An id string that cannot be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
