//! Error types for task and scheduler operations

use thiserror::Error;

use crate::task::TaskState;
use crate::types::TaskId;

/// Result type for scheduler operations
pub type Result<T> = core::result::Result<T, SchedError>;

/// Recoverable errors returned to the immediate caller
///
/// Conditions that mean the scheduling data is already corrupt are not
/// represented here; they halt the system through [`crate::panic::fatal`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Allocator exhausted (TCB, stack, FPU area) or task table full
    #[error("out of memory")]
    OutOfMemory,

    /// No task with this identifier
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// Operation not allowed on the idle task, or by a non-owner
    #[error("operation forbidden")]
    Forbidden,

    /// Argument out of range
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Called outside any running task (before the first dispatch)
    #[error("no task is running")]
    NotRunning,

    /// The task is not in a state this operation accepts
    #[error("invalid task state: {0:?}")]
    InvalidState(TaskState),
}
