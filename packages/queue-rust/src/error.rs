//! Error types for queue commands and run outcomes.

use std::fmt;

use opqueue_core::{OperationError, OperationId};

/// Errors returned by queue commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("concurrency limit must be at least 1")]
    InvalidConcurrencyLimit,
    #[error("operation queue must be created inside a tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("operation {id} is already queued")]
    AlreadyQueued { id: OperationId },
    #[error("operation queue dispatcher has stopped")]
    Closed,
}

/// Why a run settled to failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// An operation reported failure.
    OperationFailed,
    /// The caller invoked `cancel()`.
    Requested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperationFailed => f.write_str("an operation failed"),
            Self::Requested => f.write_str("cancellation requested"),
        }
    }
}

/// Failure outcome of a run, delivered once through a
/// [`RunHandle`](crate::RunHandle).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// Pending work was drained after a failure or explicit cancellation.
    #[error("run cancelled: {reason}")]
    Cancelled { reason: CancelReason },
    /// The dispatcher detected inconsistent internal state and stopped.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
    /// The dispatcher went away before the run settled.
    #[error("dispatcher stopped before the run settled")]
    DispatcherGone,
}

impl RunError {
    /// Returns `true` for errors that leave the queue unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_) | Self::DispatcherGone)
    }
}

/// Aggregate outcome of one run.
pub type RunResult = Result<(), RunError>;

/// Internal consistency failures detected by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum InvariantViolation {
    #[error("completion received for untracked operation {0}")]
    UntrackedCompletion(OperationId),
    #[error("operation {0} is in flight but was never started")]
    NotStarted(OperationId),
    #[error("{in_flight} operations in flight exceeds the limit of {limit}")]
    ConcurrencyExceeded { in_flight: usize, limit: usize },
}

impl From<InvariantViolation> for RunError {
    fn from(violation: InvariantViolation) -> Self {
        Self::InvariantViolation(violation.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_message_names_reason() {
        let err = RunError::Cancelled {
            reason: CancelReason::OperationFailed,
        };
        assert_eq!(err.to_string(), "run cancelled: an operation failed");
        assert!(!err.is_fatal());
    }

    #[test]
    fn violations_convert_to_fatal_run_errors() {
        let err: RunError = InvariantViolation::ConcurrencyExceeded {
            in_flight: 3,
            limit: 2,
        }
        .into();
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "internal invariant violated: 3 operations in flight exceeds the limit of 2"
        );
    }

    #[test]
    fn operation_errors_pass_through() {
        let id = OperationId::next();
        let err: QueueError = OperationError::AlreadyStarted { id }.into();
        assert_eq!(err.to_string(), format!("operation {id} has already been started"));
    }
}
