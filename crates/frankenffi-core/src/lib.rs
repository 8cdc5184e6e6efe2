//! Execution layer for FrankenFFI.
//!
//! - **Context** (`context`): immutable request-scoped bindings that follow
//!   nested calls and spawned tasks
//! - **Scheduler** (`scheduler`): lightweight tasks on a small carrier pool,
//!   with native calls offloaded so suspension never blocks a carrier
//! - **Structured logging** (`structured_log`): JSONL records for scheduler
//!   diagnostics and harness runs

pub mod context;
pub mod scheduler;
pub mod structured_log;

pub use context::{ContextKey, Frame, capture, get, is_bound, try_get, with, with_async};
pub use scheduler::{
    JoinHandle, Scheduler, SchedulerStats, TaskId, TaskState, UnjoinedFailure, checkpoint,
    invoke, write_shared, yield_now,
};
pub use structured_log::{LogBuffer, LogEmitter, LogEntry, LogLevel};
