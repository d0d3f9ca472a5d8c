//! Once-only units of work.
//!
//! An [`Operation`] wraps a caller-supplied executor. Starting the operation
//! hands the executor a [`Completion`] handle, which is consumed by value when
//! the outcome is reported, so an operation can report at most once. A handle
//! dropped without reporting (executor forgot, panicked, or its task was
//! aborted) reports [`OperationOutcome::Failed`].

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::types::{OperationId, OperationOutcome};

type Executor = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Errors raised by [`Operation::start`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("operation {id} has already been started")]
    AlreadyStarted { id: OperationId },
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

struct Shared {
    id: OperationId,
    label: OnceLock<String>,
    started: AtomicBool,
    executor: Mutex<Option<Executor>>,
    outcome: OnceLock<OperationOutcome>,
}

/// A self-contained unit of work that runs at most once.
///
/// `Operation` is a cheap handle: clones share the same identity, start flag
/// and outcome, so a caller can keep a clone to inspect the final state after
/// handing the operation to a queue. Equality and hashing use the id.
#[derive(Clone)]
pub struct Operation {
    shared: Arc<Shared>,
}

impl Operation {
    /// Creates an operation from an executor that reports through a
    /// [`Completion`] handle, either inline or later from another task.
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                id: OperationId::next(),
                label: OnceLock::new(),
                started: AtomicBool::new(false),
                executor: Mutex::new(Some(Box::new(executor))),
                outcome: OnceLock::new(),
            }),
        }
    }

    /// Creates an operation that spawns `fut` on the current tokio runtime
    /// when started. `Ok` reports success, `Err` reports failure.
    pub fn from_future<F, E>(fut: F) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Self::new(move |done: Completion| {
            tokio::spawn(async move {
                match fut.await {
                    Ok(()) => done.succeed(),
                    Err(err) => {
                        debug!(op = %done.operation_id(), error = %err, "operation returned an error");
                        done.fail();
                    }
                }
            });
        })
    }

    /// Attaches a human-readable label used in log lines. The first label set
    /// on an operation (or any of its clones) wins.
    #[must_use]
    pub fn with_label(self, label: impl Into<String>) -> Self {
        let _ = self.shared.label.set(label.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.shared.id
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.shared.label.get().map(String::as_str)
    }

    /// Returns `true` once the operation has been started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// Returns the reported outcome, or `None` while still unsettled.
    #[must_use]
    pub fn outcome(&self) -> Option<OperationOutcome> {
        self.shared.outcome.get().copied()
    }

    /// Runs the executor and returns a future resolving to its outcome.
    ///
    /// A panic raised synchronously by the executor is caught and reported as
    /// [`OperationOutcome::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::AlreadyStarted`] if this operation (or a clone
    /// of it) was started before.
    pub fn start(&self) -> Result<OutcomeFuture, OperationError> {
        let Some(executor) = self.shared.executor.lock().take() else {
            return Err(OperationError::AlreadyStarted { id: self.id() });
        };
        self.shared.started.store(true, Ordering::Release);

        let (tx, rx) = oneshot::channel();
        let completion = Completion {
            shared: Arc::clone(&self.shared),
            tx: Some(tx),
        };

        // The completion is moved into the closure; on unwind it is dropped
        // and reports failure.
        if panic::catch_unwind(AssertUnwindSafe(move || executor(completion))).is_err() {
            warn!(op = %self, "executor panicked; operation reported as failed");
        }

        Ok(OutcomeFuture { id: self.id(), rx })
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Operation {}

impl Hash for Operation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("started", &self.is_started())
            .field("outcome", &self.outcome())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label() {
            Some(label) => write!(f, "{} ({label})", self.id()),
            None => write!(f, "{}", self.id()),
        }
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Handle given to an executor for reporting its outcome exactly once.
///
/// Reporting consumes the handle. Dropping it unreported counts as failure.
pub struct Completion {
    shared: Arc<Shared>,
    tx: Option<oneshot::Sender<OperationOutcome>>,
}

impl Completion {
    #[must_use]
    pub fn operation_id(&self) -> OperationId {
        self.shared.id
    }

    pub fn succeed(self) {
        self.report(OperationOutcome::Succeeded);
    }

    pub fn fail(self) {
        self.report(OperationOutcome::Failed);
    }

    /// Reports the outcome matching `result`.
    pub fn finish<T, E>(self, result: &Result<T, E>) {
        self.report(OperationOutcome::from_result(result));
    }

    pub fn report(mut self, outcome: OperationOutcome) {
        self.settle(outcome);
    }

    fn settle(&mut self, outcome: OperationOutcome) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let first = self.shared.outcome.set(outcome).is_ok();
        debug_assert!(first, "operation {} settled twice", self.shared.id);
        // The receiver may already be gone if nobody awaits the outcome.
        let _ = tx.send(outcome);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.tx.is_some() {
            debug!(op = %self.shared.id, "completion dropped without a report; marking failed");
            self.settle(OperationOutcome::Failed);
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("operation", &self.shared.id)
            .field("reported", &self.tx.is_none())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// OutcomeFuture
// ---------------------------------------------------------------------------

/// Resolves once the started operation reports its outcome.
#[derive(Debug)]
pub struct OutcomeFuture {
    id: OperationId,
    rx: oneshot::Receiver<OperationOutcome>,
}

impl OutcomeFuture {
    #[must_use]
    pub fn operation_id(&self) -> OperationId {
        self.id
    }
}

impl Future for OutcomeFuture {
    type Output = OperationOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A closed channel without a value cannot be a success.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(OperationOutcome::Failed))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn inline_success_is_observed() {
        let op = Operation::new(Completion::succeed);
        assert!(!op.is_started());
        assert_eq!(op.outcome(), None);

        let outcome = op.start().unwrap().await;
        assert_eq!(outcome, OperationOutcome::Succeeded);
        assert!(op.is_started());
        assert_eq!(op.outcome(), Some(OperationOutcome::Succeeded));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let runs = Arc::new(AtomicU32::new(0));
        let op = Operation::new({
            let runs = Arc::clone(&runs);
            move |done| {
                runs.fetch_add(1, Ordering::SeqCst);
                done.succeed();
            }
        });

        let first = op.start().unwrap();
        let err = op.clone().start().unwrap_err();
        assert_eq!(err, OperationError::AlreadyStarted { id: op.id() });
        assert_eq!(first.await, OperationOutcome::Succeeded);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_report_from_spawned_task() {
        let op = Operation::new(|done| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                done.fail();
            });
        });

        let fut = op.start().unwrap();
        assert_eq!(fut.operation_id(), op.id());
        assert_eq!(op.outcome(), None);
        assert_eq!(fut.await, OperationOutcome::Failed);
        assert_eq!(op.outcome(), Some(OperationOutcome::Failed));
    }

    #[tokio::test]
    async fn dropped_completion_reports_failure() {
        let op = Operation::new(drop);
        assert_eq!(op.start().unwrap().await, OperationOutcome::Failed);
        assert_eq!(op.outcome(), Some(OperationOutcome::Failed));
    }

    #[tokio::test]
    async fn panicking_executor_reports_failure() {
        let op = Operation::new(|_done| panic!("executor blew up"));
        let fut = op.start().unwrap();
        assert!(op.is_started());
        assert_eq!(fut.await, OperationOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn from_future_maps_result() {
        let ok = Operation::from_future(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<(), String>(())
        });
        let err = Operation::from_future(async { Err::<(), _>("nope".to_string()) });

        assert_eq!(ok.start().unwrap().await, OperationOutcome::Succeeded);
        assert_eq!(err.start().unwrap().await, OperationOutcome::Failed);
    }

    #[tokio::test]
    async fn finish_uses_result() {
        let op = Operation::new(|done| done.finish(&Err::<(), _>("bad input")));
        assert_eq!(op.start().unwrap().await, OperationOutcome::Failed);
    }

    #[test]
    fn clones_share_identity_and_label() {
        let op = Operation::new(Completion::succeed).with_label("fetch");
        let clone = op.clone();
        assert_eq!(op, clone);
        assert_eq!(clone.label(), Some("fetch"));
        assert_eq!(op.to_string(), format!("{} (fetch)", op.id()));

        let relabelled = clone.with_label("other");
        assert_eq!(relabelled.label(), Some("fetch"));
    }

    #[test]
    fn distinct_operations_are_not_equal() {
        let a = Operation::new(Completion::succeed);
        let b = Operation::new(Completion::succeed);
        assert_ne!(a, b);
        assert!(b.id() > a.id());
    }
}
