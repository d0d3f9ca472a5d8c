//! Identity and outcome types shared by operations and the queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide source of operation identifiers. Starts at 1 so that `op-0`
/// never appears in logs.
static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, never-reused identifier of an [`Operation`](crate::Operation).
///
/// Identifiers are allocated from a monotonic counter, so within one process
/// a later operation always has a larger id than an earlier one. Displays as
/// `op-<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    /// Allocates the next identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value, for diagnostics.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Final outcome reported by an operation's executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationOutcome {
    /// The executor reported success.
    Succeeded,
    /// The executor reported failure, panicked, or dropped its completion handle.
    Failed,
}

impl OperationOutcome {
    /// Maps `Ok` to `Succeeded` and any `Err` to `Failed`.
    #[must_use]
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(_) => Self::Failed,
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let a = OperationId::next();
        let b = OperationId::next();
        assert!(b > a);
        assert_ne!(a, b);
    }

    #[test]
    fn id_display_format() {
        let id = OperationId(42);
        assert_eq!(id.to_string(), "op-42");
        assert_eq!(id.as_u64(), 42);
    }

    #[test]
    fn outcome_from_result() {
        let ok: Result<(), &str> = Ok(());
        let err: Result<(), &str> = Err("boom");
        assert_eq!(OperationOutcome::from_result(&ok), OperationOutcome::Succeeded);
        assert_eq!(OperationOutcome::from_result(&err), OperationOutcome::Failed);
        assert!(OperationOutcome::Succeeded.is_success());
        assert!(!OperationOutcome::Failed.is_success());
    }

    proptest! {
        #[test]
        fn allocated_ids_never_repeat(count in 1usize..500) {
            let ids: HashSet<OperationId> = (0..count).map(|_| OperationId::next()).collect();
            prop_assert_eq!(ids.len(), count);
        }
    }
}
