//! Task tracking.
//!
//! - `types`: task model, progress, filters and counts
//! - `registry`: the state machine, guarded by a terminal-state check
//! - `supervisor`: drives operations and enforces the cancel grace period
//! - `errors`: `TaskError` and `OperationError`

pub mod errors;
pub mod registry;
pub mod supervisor;
pub mod types;

pub use errors::{OperationError, TaskError};
pub use registry::{CancelOutcome, TaskRegistry, TaskSignals};
pub use supervisor::{TaskContext, TaskSupervisor};
pub use types::{
    Task, TaskCounts, TaskFilter, TaskId, TaskKind, TaskPriority, TaskProgress, TaskSpec,
    TaskStatus,
};
