//! Dependency gate: decides from the execution log alone whether a task may
//! run. No I/O.

use crate::core::Task;
use crate::store::{EntryStatus, ExecutionLogDocument};

/// True when every dependency has a `completed` entry. Missing, pending,
/// in-progress and failed dependencies all keep the gate closed.
pub fn dependencies_satisfied(task: &Task, log: &ExecutionLogDocument) -> bool {
    task.depends_on
        .iter()
        .all(|dep| log.status_of(dep) == Some(EntryStatus::Completed))
}

/// True when the task already has a terminal entry.
pub fn is_done(task_id: &str, log: &ExecutionLogDocument) -> bool {
    log.status_of(task_id).is_some_and(EntryStatus::is_terminal)
}

/// First dependency recorded as `failed`, if any. Such a task can never run.
pub fn failed_dependency<'a>(task: &'a Task, log: &ExecutionLogDocument) -> Option<&'a str> {
    task.depends_on
        .iter()
        .find(|dep| log.status_of(dep) == Some(EntryStatus::Failed))
        .map(String::as_str)
}
