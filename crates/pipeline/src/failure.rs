use serde::{Deserialize, Serialize};
use thiserror::Error;

use clipforge_generation::ValidationError;

use crate::provider::ProviderError;

/// Failure taxonomy for generation jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad input.
    Client,
    /// The job is already terminal; nothing new is attempted.
    IdempotencyConflict,
    /// A generation call failed or produced an invalid/empty result.
    Provider,
    /// A write failed after the providers succeeded. The output exists.
    Persistence,
    /// Synthetic failure issued by the Recovery Manager after a restart.
    RestartInterruption,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Client => "client_error",
            FailureKind::IdempotencyConflict => "idempotency_conflict",
            FailureKind::Provider => "provider_error",
            FailureKind::Persistence => "persistence_error",
            FailureKind::RestartInterruption => "restart_interruption",
        }
    }

    /// Whether the broker may spend another attempt on this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Provider)
    }

    /// Whether the terminal failure path credits the job cost back.
    ///
    /// Persistence failures keep the debit (the output was produced); idempotency
    /// conflicts refer to a job whose own failure was already settled.
    pub fn refunds(&self) -> bool {
        match self {
            FailureKind::Client | FailureKind::Provider | FailureKind::RestartInterruption => true,
            FailureKind::IdempotencyConflict | FailureKind::Persistence => false,
        }
    }
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure returned by an executor (and synthesised by recovery).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Client, message)
    }

    pub fn idempotency_conflict(message: impl Into<String>) -> Self {
        Self::new(FailureKind::IdempotencyConflict, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Provider, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Persistence, message)
    }

    pub fn restart_interruption() -> Self {
        Self::new(
            FailureKind::RestartInterruption,
            "job was interrupted by a service restart",
        )
    }
}

impl From<ProviderError> for JobFailure {
    fn from(value: ProviderError) -> Self {
        JobFailure::provider(value.to_string())
    }
}

impl From<ValidationError> for JobFailure {
    fn from(value: ValidationError) -> Self {
        JobFailure::client(value.to_string())
    }
}
