//! Public handle to a bounded-concurrency operation queue.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use opqueue_core::Operation;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::QueueConfig;
use crate::dispatcher::{Command, Dispatcher};
use crate::error::{QueueError, RunError, RunResult};
use crate::status::QueueStatus;

// ---------------------------------------------------------------------------
// OperationQueue
// ---------------------------------------------------------------------------

/// Runs added operations with at most `concurrency_limit` in flight and
/// reports one aggregate outcome per run.
///
/// The queue's state lives in a dispatcher task spawned by [`new`](Self::new);
/// this type is a cheap cloneable handle to it. Every command resolves only
/// after the dispatcher has applied it, so [`status`](Self::status) read
/// afterwards reflects the change. Dropping all handles lets the dispatcher
/// finish the current run and exit.
#[derive(Debug, Clone)]
pub struct OperationQueue {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<QueueStatus>,
    concurrency_limit: usize,
}

impl OperationQueue {
    /// Creates a queue and spawns its dispatcher on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConcurrencyLimit`] for a limit of zero and
    /// [`QueueError::NoRuntime`] when called outside a tokio runtime.
    pub fn new(concurrency_limit: usize, config: QueueConfig) -> Result<Self, QueueError> {
        if concurrency_limit == 0 {
            return Err(QueueError::InvalidConcurrencyLimit);
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime)?;

        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(QueueStatus::default());
        let dispatcher = Dispatcher::new(concurrency_limit, config, status_tx);
        runtime.spawn(dispatcher.run(rx));

        Ok(Self {
            commands,
            status,
            concurrency_limit,
        })
    }

    /// Appends one operation to the pending collection. Allowed while a run
    /// is in progress; the operation is dispatched as soon as a slot frees up.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Operation`] if the operation was already started,
    /// [`QueueError::AlreadyQueued`] if it is already pending or in flight, and
    /// [`QueueError::Closed`] if the dispatcher has stopped.
    pub async fn add_operation(&self, operation: Operation) -> Result<(), QueueError> {
        self.request(|reply| Command::Add {
            operations: vec![operation],
            strict: true,
            reply,
        })
        .await?
        .map(|_| ())
    }

    /// Appends every valid operation and returns how many were queued.
    /// Already-started and already-queued operations are skipped silently.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the dispatcher has stopped.
    pub async fn add_operations<I>(&self, operations: I) -> Result<usize, QueueError>
    where
        I: IntoIterator<Item = Operation>,
    {
        let operations = operations.into_iter().collect();
        self.request(|reply| Command::Add {
            operations,
            strict: false,
            reply,
        })
        .await?
    }

    /// Starts dispatching pending operations.
    ///
    /// From idle this begins a fresh run, clearing any earlier cancellation.
    /// With nothing pending the returned handle is already settled to
    /// success. While a run is in progress the returned handle settles with
    /// that run's outcome.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the dispatcher has stopped.
    pub async fn start(&self) -> Result<RunHandle, QueueError> {
        self.start_with(std::iter::empty()).await
    }

    /// Merges `operations` (filtered like [`add_operations`](Self::add_operations))
    /// and then behaves like [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the dispatcher has stopped.
    pub async fn start_with<I>(&self, operations: I) -> Result<RunHandle, QueueError>
    where
        I: IntoIterator<Item = Operation>,
    {
        let operations = operations.into_iter().collect();
        let rx = self
            .request(|reply| Command::Start { operations, reply })
            .await?;
        Ok(RunHandle::new(rx))
    }

    /// Drains pending operations and fails the current run. In-flight
    /// operations keep running; the run settles once they have all reported.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the dispatcher has stopped.
    pub async fn cancel(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    #[must_use]
    pub fn status(&self) -> QueueStatus {
        *self.status.borrow()
    }

    /// Returns a receiver notified on every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<QueueStatus> {
        self.status.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status().cancelled
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.status().pending
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.status().in_flight
    }

    #[must_use]
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Settles once with the outcome of the run it was obtained for.
#[derive(Debug)]
#[must_use = "a RunHandle does nothing unless awaited"]
pub struct RunHandle {
    rx: oneshot::Receiver<RunResult>,
    settled: Option<RunResult>,
}

impl RunHandle {
    fn new(rx: oneshot::Receiver<RunResult>) -> Self {
        Self { rx, settled: None }
    }

    /// Returns the outcome without waiting, or `None` while the run is still
    /// in progress.
    pub fn try_result(&mut self) -> Option<RunResult> {
        if self.settled.is_none() {
            self.settled = match self.rx.try_recv() {
                Ok(result) => Some(result),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => Some(Err(RunError::DispatcherGone)),
            };
        }
        self.settled.clone()
    }
}

impl Future for RunHandle {
    type Output = RunResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.settled.take() {
            return Poll::Ready(result);
        }
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RunError::DispatcherGone)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
