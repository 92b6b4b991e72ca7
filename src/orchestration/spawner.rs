//! Launches worker processes against a shared workspace.
//!
//! Each worker is a child process of the current binary running the
//! `worker` subcommand; the workers coordinate purely through the
//! workspace files.

use futures::future::join_all;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{Config, Workspace, MAX_WORKERS};
use crate::core::Task;
use crate::store::{ExecutionLog, TaskStore};
use crate::util::tail_lines;
use crate::{Error, Result};

/// Idle scans a spawned worker tolerates before exiting when the
/// configuration does not set `max_idle_cycles`.
pub const DEFAULT_SPAWNED_IDLE_CYCLES: u32 = 3;
/// Tasks listed by a dry run.
pub const DRY_RUN_PREVIEW: usize = 5;
const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker_index: usize,
    /// `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    DryRun {
        num_workers: usize,
        total_tasks: usize,
        preview: Vec<Task>,
    },
    Finished(Vec<WorkerExit>),
}

pub struct Spawner {
    workspace: Workspace,
    config: Config,
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl Spawner {
    /// Spawner that re-executes the running binary.
    ///
    /// # Errors
    /// Returns `Error::Spawn` if the current executable cannot be resolved.
    pub fn new(workspace: Workspace, config: Config) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| Error::Spawn(format!("cannot locate current executable: {}", e)))?;
        Ok(Self {
            workspace,
            config,
            program,
            leading_args: Vec::new(),
        })
    }

    /// Run `program` with `leading_args` placed before the worker arguments.
    pub fn with_program<I, S>(mut self, program: impl Into<PathBuf>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.program = program.into();
        self.leading_args = leading_args.into_iter().map(Into::into).collect();
        self
    }

    /// Arguments passed to every child after `leading_args`.
    pub fn worker_args(&self) -> Vec<OsString> {
        let max_idle = self
            .config
            .max_idle_cycles
            .unwrap_or(DEFAULT_SPAWNED_IDLE_CYCLES);
        vec![
            "--workspace".into(),
            self.workspace.root().as_os_str().to_owned(),
            "worker".into(),
            "--max-idle".into(),
            max_idle.to_string().into(),
        ]
    }

    /// Prepare the workspace and run `num_workers` workers to completion.
    ///
    /// # Errors
    /// * `Error::Validation` if `num_workers` is outside `1..=MAX_WORKERS` or
    ///   the queue is empty.
    /// * `Error::Spawn` if a child process cannot be started.
    pub async fn start(&self, num_workers: usize, dry_run: bool) -> Result<StartOutcome> {
        if num_workers == 0 || num_workers > MAX_WORKERS {
            return Err(Error::Validation(format!(
                "Number of workers must be between 1 and {}, got {}",
                MAX_WORKERS, num_workers
            )));
        }

        self.workspace.ensure_dirs()?;
        ExecutionLog::new(self.workspace.execution_log_path()).initialize()?;

        let queue = TaskStore::new(self.workspace.queue_path()).read()?;
        if queue.is_empty() {
            return Err(Error::Validation(
                "No tasks in queue. Add tasks with 'swarm add' first.".to_string(),
            ));
        }

        if dry_run {
            return Ok(StartOutcome::DryRun {
                num_workers,
                total_tasks: queue.len(),
                preview: queue.tasks.into_iter().take(DRY_RUN_PREVIEW).collect(),
            });
        }

        info!(num_workers, tasks = queue.len(), "starting workers");
        let mut children = Vec::with_capacity(num_workers);
        for worker_index in 0..num_workers {
            let child = Command::new(&self.program)
                .args(&self.leading_args)
                .args(self.worker_args())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    Error::Spawn(format!(
                        "worker {} ({}): {}",
                        worker_index,
                        self.program.display(),
                        e
                    ))
                })?;
            children.push((worker_index, child));
        }

        let exits = join_all(children.into_iter().map(|(worker_index, child)| async move {
            match child.wait_with_output().await {
                Ok(output) => WorkerExit {
                    worker_index,
                    exit_code: output.status.code(),
                    stdout_tail: tail_lines(&String::from_utf8_lossy(&output.stdout), OUTPUT_TAIL_LINES),
                    stderr_tail: tail_lines(&String::from_utf8_lossy(&output.stderr), OUTPUT_TAIL_LINES),
                },
                Err(e) => WorkerExit {
                    worker_index,
                    exit_code: None,
                    stdout_tail: String::new(),
                    stderr_tail: e.to_string(),
                },
            }
        }))
        .await;

        for exit in exits.iter().filter(|exit| !exit.success()) {
            warn!(worker_index = exit.worker_index, exit_code = ?exit.exit_code, "worker exited abnormally");
        }
        Ok(StartOutcome::Finished(exits))
    }
}
