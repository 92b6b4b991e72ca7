//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary workspaces with a populated queue
//! - A scripted executor that records what it ran
//! - Predefined task sets

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use swarm::config::{Config, Workspace};
use swarm::coordination::{LockManager, Worker, WorkerOptions};
use swarm::core::Task;
use swarm::orchestration::{ExecutionFailure, ExecutionResult, ExecutionSuccess, Executor};
use swarm::store::{ExecutionLog, ExecutionLogDocument, TaskStore};

pub const TEST_API: &str = "http://127.0.0.1:8420";

/// A workspace in a temporary directory.
pub struct TestWorkspace {
    _dir: TempDir,
    pub workspace: Workspace,
    pub config: Config,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let workspace = Workspace::new(dir.path());
        workspace.ensure_dirs().expect("Failed to create workspace");
        Self {
            _dir: dir,
            workspace,
            config: Config::default(),
        }
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let ws = Self::new();
        for task in tasks {
            ws.store()
                .add_task(task, TEST_API)
                .expect("Failed to add task");
        }
        ws
    }

    pub fn store(&self) -> TaskStore {
        TaskStore::new(self.workspace.queue_path())
    }

    pub fn log(&self) -> ExecutionLog {
        ExecutionLog::new(self.workspace.execution_log_path())
    }

    pub fn log_doc(&self) -> ExecutionLogDocument {
        self.log().read().expect("Failed to read execution log")
    }

    pub fn locks(&self) -> LockManager {
        LockManager::new(self.workspace.locks_dir(), self.config.lock_timeout())
    }

    pub fn worker(&self, executor: Arc<ScriptedExecutor>, options: WorkerOptions) -> Worker {
        Worker::new(&self.workspace, &self.config, executor, options)
    }
}

/// Options that let a worker drain the queue quickly and then exit.
pub fn draining(max_idle: u32) -> WorkerOptions {
    WorkerOptions {
        max_iterations: None,
        max_idle_cycles: Some(max_idle),
        idle_sleep: Duration::from_millis(5),
    }
}

type Hook = Box<dyn Fn(&Task) + Send + Sync>;

/// Executor that records every call and can fail, delay or run a hook.
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<String>>,
    failing: HashSet<String>,
    delay: Duration,
    running: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
    hook: Option<Hook>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Run `hook` while the task is executing (its lock is held).
    pub fn with_hook(mut self, hook: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Times a task started while another execution of the same task was
    /// still running.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, task: &Task) -> ExecutionResult {
        self.calls.lock().unwrap().push(task.id.clone());
        if !self.running.lock().unwrap().insert(task.id.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(hook) = &self.hook {
            hook(task);
        }

        self.running.lock().unwrap().remove(&task.id);
        if self.failing.contains(&task.id) {
            Err(ExecutionFailure::new("TaskFailed", format!("{} exploded", task.id)))
        } else {
            Ok(ExecutionSuccess::new(format!("{} done", task.id)).with_cost(Some(0.01)))
        }
    }
}

/// `count` tasks with no dependencies: `task_000`, `task_001`, ...
pub fn independent_tasks(count: usize) -> Vec<Task> {
    (0..count)
        .map(|i| Task::new(&format!("task_{:03}", i)).with_description("independent work"))
        .collect()
}

/// a -> b -> c, listed in reverse so store order fights dependency order.
pub fn reversed_chain() -> Vec<Task> {
    vec![
        Task::new("c").with_dependencies(["b"]),
        Task::new("b").with_dependencies(["a"]),
        Task::new("a"),
    ]
}

/// a -> {b, c} -> d
pub fn diamond() -> Vec<Task> {
    vec![
        Task::new("a"),
        Task::new("b").with_dependencies(["a"]),
        Task::new("c").with_dependencies(["a"]),
        Task::new("d").with_dependencies(["b", "c"]),
    ]
}
