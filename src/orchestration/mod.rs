//! Orchestration layer: executors that carry out tasks, the wave scheduler
//! that runs a dependency graph in-process, and the spawner that launches
//! worker processes.

pub mod claude;
pub mod executor;
pub mod http;
pub mod scheduler;
pub mod spawner;

pub use claude::{ClaudeExecutor, ClaudeResponse, ResultType};
pub use executor::{
    build_executor, execute_guarded, ExecutionFailure, ExecutionResult, ExecutionSuccess, Executor,
};
pub use http::HttpExecutor;
pub use scheduler::{
    execution_plan, load_tasks, PlanStep, ScheduleReport, SchedulerEvent, WaveScheduler,
    DEFAULT_MAX_CONCURRENT,
};
pub use spawner::{Spawner, StartOutcome, WorkerExit};
