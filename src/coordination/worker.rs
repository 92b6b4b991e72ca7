//! Worker loop.
//!
//! A worker repeatedly scans the task store for a task that is not done and
//! whose dependencies have completed, claims it with a lock file, runs it
//! through the executor, records the outcome in the execution log and
//! releases the lock. Any number of worker processes may share a workspace.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, Workspace};
use crate::coordination::gate;
use crate::coordination::halt::{HaltState, KillSwitch};
use crate::coordination::lock::LockManager;
use crate::core::Task;
use crate::orchestration::executor::{execute_guarded, Executor};
use crate::store::{EntryStatus, ExecutionLog, LogEntry, TaskStore};
use crate::util::blocking;
use crate::Result;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Stop after this many scans, whether or not they found work.
    pub max_iterations: Option<u32>,
    /// Stop after this many consecutive scans found nothing to do.
    pub max_idle_cycles: Option<u32>,
    pub idle_sleep: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_iterations: None,
            max_idle_cycles: None,
            idle_sleep: Duration::from_secs(2),
        }
    }
}

impl WorkerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: None,
            max_idle_cycles: config.max_idle_cycles,
            idle_sleep: config.idle_sleep(),
        }
    }
}

/// Result of one scan over the task store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Executed { task_id: String, status: EntryStatus },
    /// Nothing eligible and unlocked.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    IterationLimit,
    Idle,
    Halted,
    Cancelled,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::IterationLimit => write!(f, "iteration limit reached"),
            ExitReason::Idle => write!(f, "no work left"),
            ExitReason::Halted => write!(f, "halted"),
            ExitReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: String,
    /// Scans performed, including idle and paused ones.
    pub iterations: u32,
    pub executed: u32,
    pub completed: u32,
    pub failed: u32,
    pub idle_cycles: u32,
    pub exit_reason: ExitReason,
}

impl std::fmt::Display for WorkerReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} scans, executed {} ({} completed, {} failed), {} idle, exit: {}",
            self.worker_id,
            self.iterations,
            self.executed,
            self.completed,
            self.failed,
            self.idle_cycles,
            self.exit_reason
        )
    }
}

pub struct Worker {
    worker_id: String,
    store: TaskStore,
    log: ExecutionLog,
    locks: LockManager,
    kill_switch: KillSwitch,
    executor: Arc<dyn Executor>,
    options: WorkerOptions,
}

impl Worker {
    /// Worker over the standard workspace layout.
    pub fn new(
        workspace: &Workspace,
        config: &Config,
        executor: Arc<dyn Executor>,
        options: WorkerOptions,
    ) -> Self {
        Self::with_parts(
            TaskStore::new(workspace.queue_path()),
            ExecutionLog::new(workspace.execution_log_path()),
            LockManager::new(workspace.locks_dir(), config.lock_timeout()),
            KillSwitch::new(workspace),
            executor,
            options,
        )
    }

    pub fn with_parts(
        store: TaskStore,
        log: ExecutionLog,
        locks: LockManager,
        kill_switch: KillSwitch,
        executor: Arc<dyn Executor>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            worker_id: generate_worker_id(),
            store,
            log,
            locks,
            kill_switch,
            executor,
            options,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// One scan: claim the first eligible task in store order, execute it,
    /// record the outcome and release the lock.
    ///
    /// # Errors
    /// Store or log I/O failures. The lock is released even then.
    pub async fn find_and_execute_task(&self) -> Result<ScanOutcome> {
        let store = self.store.clone();
        let log = self.log.clone();
        let locks = self.locks.clone();
        let worker_id = self.worker_id.clone();
        let claimed = blocking(move || claim_next(&store, &log, &locks, &worker_id)).await?;

        let Some(task) = claimed else {
            return Ok(ScanOutcome::Idle);
        };

        let task_id = task.id.clone();
        let outcome = self.execute_and_record(task).await;
        if let Err(e) = self.locks.release(&task_id) {
            warn!(task_id = %task_id, error = %e, "failed to release lock");
        }
        outcome
    }

    async fn execute_and_record(&self, task: Task) -> Result<ScanOutcome> {
        let task_id = task.id.clone();
        let started = LogEntry::in_progress(&task_id, &self.worker_id);
        self.record(started.clone()).await?;
        info!(task_id = %task_id, worker_id = %self.worker_id, executor = self.executor.name(), "executing task");

        let result = execute_guarded(Arc::clone(&self.executor), task).await;
        let entry = match &result {
            Ok(success) => started.complete(&success.result_summary, success.cost_usd),
            Err(failure) => {
                warn!(task_id = %task_id, error = %failure, "task failed");
                started.fail(&failure.to_string())
            }
        };
        let status = entry.status;
        self.record(entry).await?;
        info!(task_id = %task_id, status = %status, "task finished");

        Ok(ScanOutcome::Executed { task_id, status })
    }

    async fn record(&self, entry: LogEntry) -> Result<()> {
        let log = self.log.clone();
        blocking(move || log.record(entry).map(|_| ())).await
    }

    /// Scan repeatedly until an exit condition is met.
    ///
    /// Cancellation and the HALT sentinel are checked before every scan and
    /// during idle sleeps, never while an executor call is in flight.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<WorkerReport> {
        let mut report = WorkerReport {
            worker_id: self.worker_id.clone(),
            iterations: 0,
            executed: 0,
            completed: 0,
            failed: 0,
            idle_cycles: 0,
            exit_reason: ExitReason::Idle,
        };
        let mut idle_streak = 0u32;
        info!(
            worker_id = %self.worker_id,
            max_iterations = ?self.options.max_iterations,
            max_idle_cycles = ?self.options.max_idle_cycles,
            "worker started"
        );

        let exit_reason = loop {
            if cancel.is_cancelled() {
                break ExitReason::Cancelled;
            }
            report.iterations += 1;

            let outcome = match self.kill_switch.check() {
                HaltState::Halted { reason } => {
                    info!(worker_id = %self.worker_id, reason = %reason, "halt sentinel found");
                    break ExitReason::Halted;
                }
                HaltState::Paused { reason } => {
                    debug!(worker_id = %self.worker_id, reason = %reason, "paused");
                    ScanOutcome::Idle
                }
                HaltState::Running => match self.find_and_execute_task().await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(worker_id = %self.worker_id, error = %e, "scan failed");
                        ScanOutcome::Idle
                    }
                },
            };

            let idle = match outcome {
                ScanOutcome::Executed { status, .. } => {
                    idle_streak = 0;
                    report.executed += 1;
                    match status {
                        EntryStatus::Completed => report.completed += 1,
                        _ => report.failed += 1,
                    }
                    false
                }
                ScanOutcome::Idle => {
                    idle_streak += 1;
                    report.idle_cycles += 1;
                    true
                }
            };

            if self
                .options
                .max_iterations
                .is_some_and(|max| report.iterations >= max)
            {
                break ExitReason::IterationLimit;
            }
            if idle {
                if self
                    .options
                    .max_idle_cycles
                    .is_some_and(|max| idle_streak >= max)
                {
                    break ExitReason::Idle;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break ExitReason::Cancelled,
                    _ = tokio::time::sleep(self.options.idle_sleep) => {}
                }
            }
        };
        report.exit_reason = exit_reason;

        info!(
            worker_id = %self.worker_id,
            iterations = report.iterations,
            executed = report.executed,
            completed = report.completed,
            failed = report.failed,
            exit = %report.exit_reason,
            "worker stopped"
        );
        Ok(report)
    }
}

/// `worker-<pid>-<8 hex chars>`.
pub fn generate_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &suffix[..8])
}

fn claim_next(
    store: &TaskStore,
    log: &ExecutionLog,
    locks: &LockManager,
    worker_id: &str,
) -> Result<Option<Task>> {
    let queue = store.read()?;
    let snapshot = log.read()?;

    for task in queue.tasks {
        if gate::is_done(&task.id, &snapshot) {
            continue;
        }
        if !gate::dependencies_satisfied(&task, &snapshot) {
            if let Some(dep) = gate::failed_dependency(&task, &snapshot) {
                debug!(task_id = %task.id, failed_dependency = %dep, "task permanently blocked");
            }
            continue;
        }
        match locks.try_acquire(&task.id, worker_id) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "cannot lock task, skipping");
                continue;
            }
        }
        // Another worker may have finished the task between our log read
        // and the acquire.
        let fresh = match log.read() {
            Ok(fresh) => fresh,
            Err(e) => {
                let _ = locks.release(&task.id);
                return Err(e);
            }
        };
        if gate::is_done(&task.id, &fresh) {
            locks.release(&task.id)?;
            continue;
        }
        debug!(task_id = %task.id, worker_id = %worker_id, "task claimed");
        return Ok(Some(task));
    }
    Ok(None)
}
