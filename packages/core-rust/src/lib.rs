//! `opqueue` core: once-only operations, completion handles, and outcomes.

pub mod operation;
pub mod types;

pub use operation::{Completion, Operation, OperationError, OutcomeFuture};
pub use types::{OperationId, OperationOutcome};
