//! In-memory wave scheduler.
//!
//! Runs a whole dependency graph inside one process. Each wave dispatches
//! every task whose prerequisites have completed, at most `max_concurrent`
//! at a time, and waits for all of them before computing the next wave.
//! A failed task blocks everything downstream of it.

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::dag::TaskDAG;
use crate::core::task::{Task, TaskOutcome};
use crate::error::Result;
use crate::orchestration::executor::{execute_guarded, ExecutionResult, Executor};

pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Events emitted by the scheduler for task lifecycle changes.
///
/// Receivers must keep draining the channel; the scheduler waits for room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    WaveStarted { wave: usize, task_ids: Vec<String> },
    TaskCompleted { task_id: String },
    TaskFailed { task_id: String, error: String },
    TaskBlocked { task_id: String, by: String },
    /// The run ended; nothing else will be sent.
    Finished { completed: usize, failed: usize },
}

/// Summary of a scheduler run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleReport {
    /// Task ids dispatched in each wave, in dispatch order.
    pub waves: Vec<Vec<String>>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
    pub skipped: Vec<String>,
    pub outcomes: BTreeMap<String, TaskOutcome>,
}

impl ScheduleReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && self.skipped.is_empty()
    }
}

impl std::fmt::Display for ScheduleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Waves: {}", self.waves.len())?;
        for (i, wave) in self.waves.iter().enumerate() {
            writeln!(f, "  {}: {}", i + 1, wave.join(", "))?;
        }
        writeln!(f, "Completed: {}", self.completed.len())?;
        writeln!(f, "Failed:    {}", self.failed.len())?;
        for id in &self.failed {
            if let Some(outcome) = self.outcomes.get(id) {
                writeln!(f, "  {}: {}", id, outcome)?;
            }
        }
        writeln!(f, "Blocked:   {}", self.blocked.len())?;
        for id in &self.blocked {
            if let Some(outcome) = self.outcomes.get(id) {
                writeln!(f, "  {}: {}", id, outcome)?;
            }
        }
        write!(f, "Skipped:   {}", self.skipped.len())
    }
}

pub struct WaveScheduler {
    max_concurrent: usize,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl WaveScheduler {
    /// A `max_concurrent` of zero is treated as one.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Run every task in the graph.
    ///
    /// The graph is validated first; a cycle aborts the run before any task
    /// starts. Cancellation stops new waves from launching; tasks that never
    /// ran are reported as skipped.
    ///
    /// # Errors
    /// Returns `Error::DependencyCycle` if the graph is cyclic.
    pub async fn run(
        &self,
        dag: &TaskDAG,
        executor: Arc<dyn Executor>,
        cancel: &CancellationToken,
    ) -> Result<ScheduleReport> {
        dag.validate()?;

        let mut outcomes: BTreeMap<String, TaskOutcome> = dag
            .all_tasks()
            .into_iter()
            .map(|t| (t.id.clone(), TaskOutcome::Pending))
            .collect();
        let mut completed: HashSet<String> = HashSet::new();
        let mut resolved: HashSet<String> = HashSet::new();
        let mut report = ScheduleReport::default();

        info!(
            tasks = dag.task_count(),
            dependencies = dag.dependency_count(),
            max_concurrent = self.max_concurrent,
            executor = executor.name(),
            "schedule starting"
        );

        loop {
            if cancel.is_cancelled() {
                warn!("schedule cancelled, no further waves");
                break;
            }

            let ready: Vec<Task> = dag
                .ready_tasks(&completed, &resolved)
                .into_iter()
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }

            let wave_ids: Vec<String> = ready.iter().map(|t| t.id.clone()).collect();
            let wave = report.waves.len() + 1;
            info!(wave, tasks = wave_ids.len(), "wave starting");
            self.emit(SchedulerEvent::WaveStarted {
                wave,
                task_ids: wave_ids.clone(),
            })
            .await;
            for id in &wave_ids {
                resolved.insert(id.clone());
                outcomes.insert(id.clone(), TaskOutcome::Running);
            }

            let results: Vec<(String, ExecutionResult)> = stream::iter(ready.into_iter().map(
                |task| {
                    let executor = Arc::clone(&executor);
                    async move {
                        let id = task.id.clone();
                        (id, execute_guarded(executor, task).await)
                    }
                },
            ))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

            for (id, result) in results {
                match result {
                    Ok(success) => {
                        info!(task_id = %id, "task completed");
                        completed.insert(id.clone());
                        outcomes.insert(
                            id.clone(),
                            TaskOutcome::Completed {
                                result_summary: success.result_summary,
                            },
                        );
                        self.emit(SchedulerEvent::TaskCompleted { task_id: id }).await;
                    }
                    Err(failure) => {
                        let error = failure.to_string();
                        warn!(task_id = %id, error = %error, "task failed");
                        outcomes.insert(id.clone(), TaskOutcome::Failed { error: error.clone() });
                        self.emit(SchedulerEvent::TaskFailed {
                            task_id: id.clone(),
                            error,
                        })
                        .await;

                        for dependent in dag.transitive_dependents(&id) {
                            if outcomes.get(&dependent.id) == Some(&TaskOutcome::Pending) {
                                resolved.insert(dependent.id.clone());
                                outcomes.insert(
                                    dependent.id.clone(),
                                    TaskOutcome::Blocked { by: id.clone() },
                                );
                                self.emit(SchedulerEvent::TaskBlocked {
                                    task_id: dependent.id.clone(),
                                    by: id.clone(),
                                })
                                .await;
                            }
                        }
                    }
                }
            }
            report.waves.push(wave_ids);
        }

        let cancelled = cancel.is_cancelled();
        for task in dag.all_tasks() {
            if outcomes.get(&task.id) != Some(&TaskOutcome::Pending) {
                continue;
            }
            let outcome = if cancelled {
                TaskOutcome::Skipped
            } else {
                let by = task
                    .depends_on
                    .iter()
                    .find(|dep| !completed.contains(*dep))
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                TaskOutcome::Blocked { by }
            };
            outcomes.insert(task.id.clone(), outcome);
        }

        for task in dag.all_tasks() {
            match outcomes.get(&task.id) {
                Some(TaskOutcome::Completed { .. }) => report.completed.push(task.id.clone()),
                Some(TaskOutcome::Failed { .. }) => report.failed.push(task.id.clone()),
                Some(TaskOutcome::Blocked { .. }) => report.blocked.push(task.id.clone()),
                Some(TaskOutcome::Skipped) => report.skipped.push(task.id.clone()),
                _ => {}
            }
        }
        report.outcomes = outcomes;

        info!(
            waves = report.waves.len(),
            completed = report.completed.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            skipped = report.skipped.len(),
            "schedule finished"
        );
        self.emit(SchedulerEvent::Finished {
            completed: report.completed.len(),
            failed: report.failed.len(),
        })
        .await;

        Ok(report)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<Task>),
    Document { tasks: Vec<Task> },
}

/// Load tasks for a schedule run: either a queue document
/// (`{"tasks": [...]}`) or a bare JSON array of tasks.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let contents = fs::read_to_string(path)?;
    let file: TaskFile = serde_json::from_str(&contents)?;
    Ok(match file {
        TaskFile::List(tasks) => tasks,
        TaskFile::Document { tasks } => tasks,
    })
}

/// One line of a dry-run plan: a task, what it waits for and what it frees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub task_id: String,
    pub depends_on: Vec<String>,
    pub unlocks: Vec<String>,
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.task_id)?;
        if !self.depends_on.is_empty() {
            write!(f, " (after {})", self.depends_on.join(", "))?;
        }
        if !self.unlocks.is_empty() {
            write!(f, " -> {}", self.unlocks.join(", "))?;
        }
        Ok(())
    }
}

/// Every task in an order that respects dependencies, without running any.
pub fn execution_plan(dag: &TaskDAG) -> Result<Vec<PlanStep>> {
    let sorted_ids = |tasks: Vec<&Task>| {
        let mut ids: Vec<String> = tasks.into_iter().map(|t| t.id.clone()).collect();
        ids.sort();
        ids
    };
    Ok(dag
        .topological_order()?
        .into_iter()
        .map(|task| PlanStep {
            task_id: task.id.clone(),
            depends_on: sorted_ids(dag.get_dependencies(&task.id)),
            unlocks: sorted_ids(dag.get_dependents(&task.id)),
        })
        .collect())
}
