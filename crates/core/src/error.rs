//! Domain error model.

use core::fmt::Display;

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic domain failures: bad input, bad ids, and status transitions the
/// current state does not allow. Storage and transport errors live with their ports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status transition that is never legal from the current status.
    #[error("cannot {action} {subject} in status {status}")]
    IllegalTransition {
        action: &'static str,
        subject: String,
        status: String,
    },

    /// The operation is legal in general but not for this resource right now
    /// (e.g. retrying a job that already completed).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn illegal_transition(
        action: &'static str,
        subject: impl Display,
        status: impl Display,
    ) -> Self {
        Self::IllegalTransition {
            action,
            subject: subject.to_string(),
            status: status.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
