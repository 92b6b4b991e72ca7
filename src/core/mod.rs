//! Core domain models: the task record and the dependency graph used by the
//! wave scheduler.

pub mod dag;
pub mod task;

pub use dag::TaskDAG;
pub use task::{Intensity, Task, TaskOutcome};
