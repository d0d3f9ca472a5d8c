//! Observable queue state.

/// Lifecycle phase of the queue.
///
/// State machine: Idle -> Running -> (Draining ->) Idle. The queue object is
/// reusable, so Idle is never terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueState {
    /// No run in progress.
    #[default]
    Idle,
    /// Dispatching pending operations against the concurrency limit.
    Running,
    /// A failure or cancellation drained pending work; waiting for in-flight
    /// operations to finish.
    Draining,
}

/// Point-in-time snapshot published by the dispatcher after every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    pub state: QueueState,
    /// Set by a failure or `cancel()`; cleared when a new run starts from idle.
    pub cancelled: bool,
    pub pending: usize,
    pub in_flight: usize,
}

impl QueueStatus {
    /// `true` from the start of a run until its outcome settles.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !matches!(self.state, QueueState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_idle() {
        let status = QueueStatus::default();
        assert_eq!(status.state, QueueState::Idle);
        assert!(!status.is_running());
        assert!(!status.cancelled);
        assert_eq!(status.pending, 0);
        assert_eq!(status.in_flight, 0);
    }

    #[test]
    fn draining_counts_as_running() {
        let status = QueueStatus {
            state: QueueState::Draining,
            cancelled: true,
            pending: 0,
            in_flight: 2,
        };
        assert!(status.is_running());
    }
}
