//! The dispatcher task that owns all queue state.
//!
//! Callers never touch pending or in-flight collections directly. They send
//! [`Command`]s over an unbounded channel and wait for a `oneshot`
//! acknowledgement; completions of started operations are polled from a
//! `FuturesUnordered` inside the same `select!` loop. Every mutation therefore
//! happens on one task, in order, without locks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{FuturesUnordered, StreamExt};
use opqueue_core::{Operation, OperationError, OperationId, OperationOutcome, OutcomeFuture};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::config::QueueConfig;
use crate::error::{CancelReason, InvariantViolation, QueueError, RunError, RunResult};
use crate::selection::Selector;
use crate::status::{QueueState, QueueStatus};

/// Lifecycle events go to `info` when verbose logging is on, `trace` otherwise.
macro_rules! lifecycle {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+);
        } else {
            tracing::trace!($($arg)+);
        }
    };
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// Messages from queue handles to the dispatcher.
#[derive(Debug)]
pub(crate) enum Command {
    /// Queue operations. With `strict`, the first invalid entry aborts the
    /// command with an error; otherwise invalid entries are skipped.
    Add {
        operations: Vec<Operation>,
        strict: bool,
        reply: oneshot::Sender<Result<usize, QueueError>>,
    },
    /// Merge a batch and begin (or join) a run.
    Start {
        operations: Vec<Operation>,
        reply: oneshot::Sender<oneshot::Receiver<RunResult>>,
    },
    /// Drain pending operations and fail the current run.
    Cancel { reply: oneshot::Sender<()> },
}

// ---------------------------------------------------------------------------
// InFlight
// ---------------------------------------------------------------------------

/// Outcome future tagged with the id of the operation it belongs to.
struct InFlight(OutcomeFuture);

impl Future for InFlight {
    type Output = (OperationId, OperationOutcome);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.0.operation_id();
        Pin::new(&mut self.0).poll(cx).map(|outcome| (id, outcome))
    }
}

/// Which outcome the current run settles to once in-flight work drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Success,
    Failure(CancelReason),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub(crate) struct Dispatcher {
    limit: usize,
    verbose: bool,
    selector: Selector,
    pending: VecDeque<Operation>,
    pending_ids: HashSet<OperationId>,
    in_flight: HashMap<OperationId, Operation>,
    completions: FuturesUnordered<InFlight>,
    state: QueueState,
    cancelled: bool,
    sink: Sink,
    waiters: Vec<oneshot::Sender<RunResult>>,
    status: watch::Sender<QueueStatus>,
}

impl Dispatcher {
    pub(crate) fn new(limit: usize, config: QueueConfig, status: watch::Sender<QueueStatus>) -> Self {
        let QueueConfig {
            verbose_logging,
            selection_policy,
            random_seed,
        } = config;
        Self {
            limit,
            verbose: verbose_logging,
            selector: Selector::new(selection_policy, random_seed),
            pending: VecDeque::new(),
            pending_ids: HashSet::new(),
            in_flight: HashMap::new(),
            completions: FuturesUnordered::new(),
            state: QueueState::Idle,
            cancelled: false,
            sink: Sink::Success,
            waiters: Vec::new(),
            status,
        }
    }

    /// Runs until every queue handle is dropped and no run is in progress, or
    /// until an internal invariant is violated.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut handles_open = true;

        loop {
            let step = tokio::select! {
                command = commands.recv(), if handles_open => match command {
                    Some(command) => self.handle(command),
                    None => {
                        handles_open = false;
                        Ok(())
                    }
                },
                Some((id, outcome)) = self.completions.next(), if !self.completions.is_empty() => {
                    self.on_complete(id, outcome)
                }
                else => break,
            };

            if let Err(violation) = step {
                self.abort(&violation);
                return;
            }
            self.publish();

            if !handles_open && self.state == QueueState::Idle {
                break;
            }
        }

        debug!(pending = self.pending.len(), "operation queue dispatcher stopped");
    }

    fn handle(&mut self, command: Command) -> Result<(), InvariantViolation> {
        match command {
            Command::Add {
                operations,
                strict,
                reply,
            } => {
                let admitted = if strict {
                    self.admit_strict(operations)
                } else {
                    Ok(self.admit_lenient(operations))
                };
                if admitted.is_ok() {
                    self.advance()?;
                }
                self.publish();
                let _ = reply.send(admitted);
            }
            Command::Start { operations, reply } => {
                let offered = operations.len();
                let admitted = self.admit_lenient(operations);
                lifecycle!(self.verbose, offered, admitted, "start requested");
                let (tx, rx) = oneshot::channel();
                self.begin_run(tx)?;
                self.publish();
                let _ = reply.send(rx);
            }
            Command::Cancel { reply } => {
                lifecycle!(self.verbose, state = ?self.state, "cancel requested");
                self.cancel_pending(CancelReason::Requested);
                self.advance()?;
                self.publish();
                let _ = reply.send(());
            }
        }
        Ok(())
    }

    /// Why `op` cannot be queued: it was already started, or it is already
    /// pending or in flight.
    fn rejection(&self, op: &Operation) -> Option<QueueError> {
        let id = op.id();
        if op.is_started() {
            Some(QueueError::from(OperationError::AlreadyStarted { id }))
        } else if self.pending_ids.contains(&id) || self.in_flight.contains_key(&id) {
            Some(QueueError::AlreadyQueued { id })
        } else {
            None
        }
    }

    fn enqueue(&mut self, op: Operation) {
        lifecycle!(self.verbose, op = %op, pending = self.pending.len() + 1, "operation added");
        self.pending_ids.insert(op.id());
        self.pending.push_back(op);
    }

    /// Queues operations in order, stopping at the first invalid one.
    fn admit_strict(&mut self, operations: Vec<Operation>) -> Result<usize, QueueError> {
        let mut admitted = 0;
        for op in operations {
            if let Some(err) = self.rejection(&op) {
                return Err(err);
            }
            self.enqueue(op);
            admitted += 1;
        }
        Ok(admitted)
    }

    /// Queues every valid operation, skipping invalid ones, and returns how
    /// many were queued.
    fn admit_lenient(&mut self, operations: Vec<Operation>) -> usize {
        let mut admitted = 0;
        for op in operations {
            if let Some(err) = self.rejection(&op) {
                debug!(op = %op, reason = %err, "skipping invalid operation");
                continue;
            }
            self.enqueue(op);
            admitted += 1;
        }
        admitted
    }

    fn begin_run(&mut self, waiter: oneshot::Sender<RunResult>) -> Result<(), InvariantViolation> {
        if self.state != QueueState::Idle {
            lifecycle!(self.verbose, state = ?self.state, "start joined the current run");
            self.waiters.push(waiter);
            return self.advance();
        }

        self.cancelled = false;
        self.sink = Sink::Success;

        if self.pending.is_empty() {
            lifecycle!(self.verbose, "nothing to run; settled immediately");
            let _ = waiter.send(Ok(()));
            return Ok(());
        }

        lifecycle!(
            self.verbose,
            pending = self.pending.len(),
            limit = self.limit,
            "starting run"
        );
        self.state = QueueState::Running;
        self.waiters.push(waiter);
        self.publish();
        self.advance()
    }

    /// Admits pending work up to the limit, then settles the run if nothing
    /// is left in flight.
    fn advance(&mut self) -> Result<(), InvariantViolation> {
        if self.state == QueueState::Idle {
            return Ok(());
        }
        self.dispatch()?;
        // dispatch() only leaves the in-flight set empty when pending is
        // exhausted or the run was cancelled.
        if self.in_flight.is_empty() {
            self.settle();
        }
        Ok(())
    }

    fn dispatch(&mut self) -> Result<(), InvariantViolation> {
        while !self.cancelled && self.in_flight.len() < self.limit {
            let Some(op) = self.selector.select(&mut self.pending) else {
                break;
            };
            let id = op.id();
            self.pending_ids.remove(&id);

            // Count the operation and publish before its executor runs, so an
            // executor reading the queue status sees itself in flight.
            self.in_flight.insert(id, op.clone());
            self.publish();

            match op.start() {
                Ok(outcome) => {
                    lifecycle!(
                        self.verbose,
                        op = %op,
                        in_flight = self.in_flight.len(),
                        pending = self.pending.len(),
                        "operation dispatched"
                    );
                    self.completions.push(InFlight(outcome));
                }
                Err(err) => {
                    // Started behind the queue's back; its outcome is not
                    // observable here, so count it as a failure.
                    self.in_flight.remove(&id);
                    warn!(op = %op, error = %err, "operation refused to start");
                    self.cancel_pending(CancelReason::OperationFailed);
                }
            }
        }

        if self.in_flight.len() > self.limit {
            return Err(InvariantViolation::ConcurrencyExceeded {
                in_flight: self.in_flight.len(),
                limit: self.limit,
            });
        }
        Ok(())
    }

    fn on_complete(
        &mut self,
        id: OperationId,
        outcome: OperationOutcome,
    ) -> Result<(), InvariantViolation> {
        let Some(op) = self.in_flight.get(&id) else {
            return Err(InvariantViolation::UntrackedCompletion(id));
        };
        if !op.is_started() {
            return Err(InvariantViolation::NotStarted(id));
        }

        match outcome {
            OperationOutcome::Succeeded => {
                lifecycle!(self.verbose, op = %op, "operation finished");
            }
            OperationOutcome::Failed => {
                lifecycle!(self.verbose, op = %op, "operation failed");
                self.cancel_pending(CancelReason::OperationFailed);
            }
        }
        self.in_flight.remove(&id);

        self.advance()
    }

    /// Switches the run to failure and drains pending operations. The first
    /// reason recorded for a run is kept.
    fn cancel_pending(&mut self, reason: CancelReason) {
        if self.sink == Sink::Success {
            self.sink = Sink::Failure(reason);
        }
        self.cancelled = true;
        if self.state == QueueState::Running {
            self.state = QueueState::Draining;
        }

        let drained = self.pending.len();
        self.pending.clear();
        self.pending_ids.clear();
        lifecycle!(
            self.verbose,
            drained,
            in_flight = self.in_flight.len(),
            "draining pending operations"
        );
    }

    fn settle(&mut self) {
        let result = match self.sink {
            Sink::Success => Ok(()),
            Sink::Failure(reason) => Err(RunError::Cancelled { reason }),
        };
        self.state = QueueState::Idle;
        self.publish();

        lifecycle!(self.verbose, ok = result.is_ok(), "run settled");
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    /// Fails every waiter with the violation. The dispatcher stops afterwards.
    fn abort(&mut self, violation: &InvariantViolation) {
        error!(error = %violation, "operation queue invariant violated; stopping dispatcher");
        let err = RunError::from(violation.clone());
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn publish(&self) {
        self.status.send_replace(QueueStatus {
            state: self.state,
            cancelled: self.cancelled,
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use opqueue_core::Completion;

    use super::*;

    fn dispatcher(limit: usize) -> Dispatcher {
        let (tx, _rx) = watch::channel(QueueStatus::default());
        Dispatcher::new(limit, QueueConfig::default(), tx)
    }

    #[tokio::test]
    async fn untracked_completion_is_a_violation() {
        let mut d = dispatcher(1);
        let id = OperationId::next();
        let err = d.on_complete(id, OperationOutcome::Succeeded).unwrap_err();
        assert_eq!(err, InvariantViolation::UntrackedCompletion(id));
    }

    #[tokio::test]
    async fn in_flight_without_start_is_a_violation() {
        let mut d = dispatcher(1);
        let op = Operation::new(Completion::succeed);
        d.in_flight.insert(op.id(), op.clone());
        let err = d.on_complete(op.id(), OperationOutcome::Succeeded).unwrap_err();
        assert_eq!(err, InvariantViolation::NotStarted(op.id()));
    }

    #[tokio::test]
    async fn abort_fails_waiters_with_fatal_error() {
        let mut d = dispatcher(1);
        let (tx, rx) = oneshot::channel();
        d.waiters.push(tx);
        d.abort(&InvariantViolation::UntrackedCompletion(OperationId::next()));
        let result = rx.await.unwrap();
        assert!(result.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn dispatch_respects_limit() {
        let mut d = dispatcher(2);
        let ops: Vec<Operation> = (0..5).map(|_| Operation::new(drop)).collect();
        assert_eq!(d.admit_lenient(ops), 5);
        d.state = QueueState::Running;
        d.dispatch().unwrap();
        assert_eq!(d.in_flight.len(), 2);
        assert_eq!(d.pending.len(), 3);
        assert_eq!(d.pending_ids.len(), 3);
    }

    #[tokio::test]
    async fn cancel_keeps_first_reason() {
        let mut d = dispatcher(1);
        d.state = QueueState::Running;
        d.cancel_pending(CancelReason::Requested);
        d.cancel_pending(CancelReason::OperationFailed);
        assert_eq!(d.sink, Sink::Failure(CancelReason::Requested));
        assert_eq!(d.state, QueueState::Draining);
        assert!(d.cancelled);
    }

    #[tokio::test]
    async fn admit_strict_rejects_duplicates() {
        let mut d = dispatcher(1);
        let op = Operation::new(Completion::succeed);
        assert_eq!(d.admit_strict(vec![op.clone()]), Ok(1));
        assert_eq!(
            d.admit_strict(vec![op.clone()]),
            Err(QueueError::AlreadyQueued { id: op.id() })
        );
        assert_eq!(d.admit_lenient(vec![op]), 0);
    }

    #[tokio::test]
    async fn executor_sees_itself_in_flight() {
        let (tx, rx) = watch::channel(QueueStatus::default());
        let mut d = Dispatcher::new(2, QueueConfig::default(), tx);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let ops: Vec<Operation> = (0..2)
            .map(|_| {
                let rx = rx.clone();
                let seen = std::sync::Arc::clone(&seen);
                Operation::new(move |done: Completion| {
                    let status = *rx.borrow();
                    seen.lock().unwrap().push((status.state, status.in_flight));
                    done.succeed();
                })
            })
            .collect();
        d.admit_lenient(ops);
        let (waiter, _result) = oneshot::channel();
        d.begin_run(waiter).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(QueueState::Running, 1), (QueueState::Running, 2)]
        );
    }
}
