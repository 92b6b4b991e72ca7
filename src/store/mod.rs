//! File-backed documents shared by every worker process.

pub mod execution_log;
pub mod queue;

pub use execution_log::{
    EntryStatus, ExecutionLog, ExecutionLogDocument, LogEntry, Recorded, SwarmSummary,
};
pub use queue::{QueueDocument, TaskStore};
