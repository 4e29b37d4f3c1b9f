//! Stepper error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for stepper operations.
pub type Result<T> = std::result::Result<T, StepperError>;

/// Errors raised while planning, running or compensating a stepper job.
#[derive(Debug, Error)]
pub enum StepperError {
    /// Malformed definition or registry content.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Dependency cycle inside a step group.
    #[error("Circular dependency in step group '{group}': {cycle}")]
    CircularDependency { group: String, cycle: String },

    /// A declared dependency never executed in this run.
    #[error("Step '{step}' depends on '{dependency}' which was not executed")]
    UnresolvedDependency { step: String, dependency: String },

    /// Unknown step, group or iterator id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Mutation of a locked step group while it is running.
    #[error("Step group '{0}' is locked while a run is in flight")]
    Locked(String),

    /// The requested operation is not handled or not enabled for the context.
    #[error("Operation '{operation}' is not available for '{context}'")]
    OperationUnavailable { operation: String, context: String },

    /// State machine violation.
    #[error("Illegal state transition for '{step}': {from} -> {to}")]
    IllegalTransition {
        step: String,
        from: String,
        to: String,
    },

    /// Precondition check failed.
    #[error("Validation failed for '{step}': {message}")]
    Validation { step: String, message: String },

    /// Step reported an error status.
    #[error("{message}")]
    Execution { step: String, message: String },

    /// Step group iterator failure.
    #[error("Iterator error in '{group}': {message}")]
    Iterator { group: String, message: String },

    /// Cancel-timeout elapsed without a callback.
    #[error("Step '{step}' did not respond to cancellation within {timeout_ms} ms")]
    Timeout { step: String, timeout_ms: u64 },

    /// The job was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A compensation failed.
    #[error("Rollback of '{step}' failed: {message}")]
    Rollback { step: String, message: String },

    /// Error raised by step code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Validation,
    Execution,
    Timeout,
    Cancelled,
    Rollback,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Validation => write!(f, "validation"),
            Self::Execution => write!(f, "execution"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

impl StepperError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_)
            | Self::CircularDependency { .. }
            | Self::UnresolvedDependency { .. }
            | Self::NotFound { .. }
            | Self::Locked(_)
            | Self::OperationUnavailable { .. }
            | Self::IllegalTransition { .. } => ErrorKind::Configuration,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Execution { .. } | Self::Iterator { .. } | Self::Other(_) => ErrorKind::Execution,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Rollback { .. } => ErrorKind::Rollback,
        }
    }

    /// Whether the job should report this error as a cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancelled | ErrorKind::Timeout)
    }

    /// Build a normalized execution error.
    pub fn execution(step: impl Into<String>, label: &str, message: impl AsRef<str>) -> Self {
        Self::Execution {
            step: step.into(),
            message: format!("{}: {}", label, message.as_ref()),
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let cycle = StepperError::CircularDependency {
            group: "g".into(),
            cycle: "a -> b -> a".into(),
        };
        assert_eq!(cycle.kind(), ErrorKind::Configuration);

        let timeout = StepperError::Timeout {
            step: "s".into(),
            timeout_ms: 10,
        };
        assert!(timeout.is_cancellation());
        assert!(!StepperError::Configuration("x".into()).is_cancellation());
    }

    #[test]
    fn test_execution_message_is_normalized() {
        let err = StepperError::execution("connect/open", "Open Channel", "refused");
        assert_eq!(err.to_string(), "Open Channel: refused");
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    #[test]
    fn test_anyhow_interop() {
        let err: StepperError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(err.to_string(), "boom");
    }
}
