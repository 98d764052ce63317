//! Domain types for the swarm: tasks, results, identifiers

pub mod id;
mod result;
mod task;

pub use result::{SpawnResult, StructuredReport, TOOL_CALLS_TIMEOUT, TaskResult, WorkerMetrics};
pub use task::{FailureCause, PartialContext, RetryContext, Task, TaskState, TaskType};

/// Current Unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
