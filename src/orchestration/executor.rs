//! Executor boundary.
//!
//! An executor performs the actual work of a task (one LLM call, one HTTP
//! request, ...). Per-task failures are values, not errors: the worker and
//! the scheduler record them and carry on.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::config::{Config, ExecutorKind, Workspace};
use crate::core::Task;
use crate::orchestration::claude::ClaudeExecutor;
use crate::orchestration::http::HttpExecutor;
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSuccess {
    pub result_summary: String,
    pub cost_usd: Option<f64>,
}

impl ExecutionSuccess {
    pub fn new(result_summary: impl Into<String>) -> Self {
        Self {
            result_summary: result_summary.into(),
            cost_usd: None,
        }
    }

    pub fn with_cost(mut self, cost_usd: Option<f64>) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}

/// Why a task failed. Displays as `"Kind: message"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub kind: String,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

pub type ExecutionResult = std::result::Result<ExecutionSuccess, ExecutionFailure>;

#[async_trait]
pub trait Executor: Send + Sync {
    /// Short name for logs, e.g. "http".
    fn name(&self) -> &str;

    async fn execute(&self, task: &Task) -> ExecutionResult;
}

/// Run the executor on its own tokio task so that a panic inside it turns
/// into a `Panic` failure instead of taking the caller down.
pub async fn execute_guarded(executor: Arc<dyn Executor>, task: Task) -> ExecutionResult {
    let handle = tokio::spawn(async move { executor.execute(&task).await });
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(ExecutionFailure::new(
            "Panic",
            panic_message(e.into_panic().as_ref()),
        )),
        Err(e) => Err(ExecutionFailure::new("Cancelled", e.to_string())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}

/// Build the executor selected in the configuration.
pub fn build_executor(config: &Config, workspace: &Workspace) -> Result<Arc<dyn Executor>> {
    Ok(match config.executor {
        ExecutorKind::Http => Arc::new(HttpExecutor::new(config)?),
        ExecutorKind::Claude => Arc::new(ClaudeExecutor::from_config(config, workspace.root())?),
    })
}
