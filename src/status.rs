//! Point-in-time view of a workspace for the `status` command.

use std::fmt;

use crate::config::{Config, Workspace};
use crate::coordination::gate;
use crate::coordination::{HaltState, KillSwitch, LockManager};
use crate::store::{EntryStatus, ExecutionLog, SwarmSummary, TaskStore};
use crate::Result;

const RULE_WIDTH: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTask {
    pub task_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedTask {
    pub task_id: String,
    pub failed_dependency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub summary: SwarmSummary,
    pub failed: Vec<FailedTask>,
    pub blocked: Vec<BlockedTask>,
    /// Lock file names currently in the locks directory.
    pub active_locks: Vec<String>,
    pub halt: HaltState,
}

impl StatusReport {
    pub fn gather(workspace: &Workspace, config: &Config) -> Result<Self> {
        let queue = TaskStore::new(workspace.queue_path()).read()?;
        let mut log = ExecutionLog::new(workspace.execution_log_path()).read()?;

        // Counts come from the entries; the stored summary may be stale if a
        // writer died between updating an entry and the summary.
        let mut summary = log.recompute_summary();
        if log.tasks.is_empty() {
            summary.total_tasks = queue.len();
            summary.pending = queue.len();
        }

        let failed = log
            .entries_with_status(EntryStatus::Failed)
            .into_iter()
            .map(|entry| FailedTask {
                task_id: entry.task_id.clone(),
                error: entry.errors.clone(),
            })
            .collect();

        let blocked = queue
            .tasks
            .iter()
            .filter(|task| !gate::is_done(&task.id, &log))
            .filter_map(|task| {
                gate::failed_dependency(task, &log).map(|dep| BlockedTask {
                    task_id: task.id.clone(),
                    failed_dependency: dep.to_string(),
                })
            })
            .collect();

        let locks = LockManager::new(workspace.locks_dir(), config.lock_timeout());

        Ok(Self {
            summary,
            failed,
            blocked,
            active_locks: locks.active_locks()?,
            halt: KillSwitch::new(workspace).check(),
        })
    }

    pub fn percent_complete(&self) -> usize {
        if self.summary.total_tasks == 0 {
            0
        } else {
            100 * self.summary.completed / self.summary.total_tasks
        }
    }
}

fn section(f: &mut fmt::Formatter<'_>, title: &str) -> fmt::Result {
    writeln!(f, "{}", "-".repeat(RULE_WIDTH))?;
    writeln!(f, "{}", title)?;
    writeln!(f, "{}", "-".repeat(RULE_WIDTH))
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.summary;
        writeln!(f, "{}", "=".repeat(RULE_WIDTH))?;
        writeln!(f, "EXECUTION STATUS")?;
        writeln!(f, "{}", "=".repeat(RULE_WIDTH))?;
        writeln!(f, "Total Tasks:  {:>5}", s.total_tasks)?;
        writeln!(f, "Completed:    {:>5} ({}%)", s.completed, self.percent_complete())?;
        writeln!(f, "In Progress:  {:>5}", s.in_progress)?;
        writeln!(f, "Pending:      {:>5}", s.pending)?;
        writeln!(f, "Failed:       {:>5}", s.failed)?;
        if !self.halt.is_running() {
            writeln!(f, "State:        {}", self.halt)?;
        }

        if !self.failed.is_empty() {
            section(f, &format!("FAILED TASKS ({})", self.failed.len()))?;
            for task in &self.failed {
                writeln!(f, "ID: {}", task.task_id)?;
                writeln!(
                    f,
                    "  Error: {}",
                    task.error.as_deref().unwrap_or("No error details recorded")
                )?;
            }
        }

        if !self.blocked.is_empty() {
            section(f, &format!("BLOCKED TASKS ({})", self.blocked.len()))?;
            for task in &self.blocked {
                writeln!(f, "  {} (dependency {} failed)", task.task_id, task.failed_dependency)?;
            }
        }

        if !self.active_locks.is_empty() {
            section(f, &format!("ACTIVE LOCKS ({})", self.active_locks.len()))?;
            for name in &self.active_locks {
                writeln!(f, "  {}", name)?;
            }
        }

        write!(f, "{}", "=".repeat(RULE_WIDTH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Task;
    use crate::store::LogEntry;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        let workspace = Workspace::new(dir.path());
        workspace.ensure_dirs().unwrap();
        (dir, workspace)
    }

    #[test]
    fn test_fresh_workspace_counts_queue() {
        let (_dir, ws) = workspace();
        let store = TaskStore::new(ws.queue_path());
        store.add_task(Task::new("a"), "http://x").unwrap();
        store.add_task(Task::new("b"), "http://x").unwrap();

        let report = StatusReport::gather(&ws, &Config::default()).unwrap();
        assert_eq!(report.summary.total_tasks, 2);
        assert_eq!(report.summary.pending, 2);
        assert_eq!(report.percent_complete(), 0);
        assert!(report.failed.is_empty());
        assert!(report.active_locks.is_empty());
        assert_eq!(report.halt, HaltState::Running);
    }

    #[test]
    fn test_counts_come_from_entries_not_stored_summary() {
        let (_dir, ws) = workspace();
        std::fs::write(
            ws.execution_log_path(),
            r#"{
                "version": "1.0",
                "tasks": {
                    "a": {"id": "a", "status": "completed"},
                    "b": {"id": "b", "status": "in_progress", "worker_id": "w1"}
                },
                "swarm_summary": {"total_tasks": 5, "completed": 0, "in_progress": 0, "pending": 5, "failed": 0}
            }"#,
        )
        .unwrap();

        let report = StatusReport::gather(&ws, &Config::default()).unwrap();
        assert_eq!(report.summary.total_tasks, 2);
        assert_eq!(report.summary.completed, 1);
        assert_eq!(report.summary.in_progress, 1);
        assert_eq!(report.summary.pending, 0);
        assert_eq!(report.percent_complete(), 50);
    }

    #[test]
    fn test_failed_blocked_and_locked() {
        let (_dir, ws) = workspace();
        let store = TaskStore::new(ws.queue_path());
        store.add_task(Task::new("a"), "http://x").unwrap();
        store.add_task(Task::new("b").with_dependencies(["a"]), "http://x").unwrap();
        store.add_task(Task::new("c"), "http://x").unwrap();
        store.add_task(Task::new("d"), "http://x").unwrap();

        let log = ExecutionLog::new(ws.execution_log_path());
        log.record(LogEntry::in_progress("a", "w1").fail("HTTPError: 500")).unwrap();
        log.record(LogEntry::new("c", EntryStatus::Completed)).unwrap();

        let config = Config::default();
        LockManager::new(ws.locks_dir(), config.lock_timeout())
            .try_acquire("d", "w2")
            .unwrap();
        KillSwitch::new(&ws).pause("maintenance").unwrap();

        let report = StatusReport::gather(&ws, &config).unwrap();
        assert_eq!(report.summary.total_tasks, 2);
        assert_eq!(report.summary.completed, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.percent_complete(), 50);
        assert_eq!(
            report.failed,
            vec![FailedTask {
                task_id: "a".into(),
                error: Some("HTTPError: 500".into())
            }]
        );
        assert_eq!(
            report.blocked,
            vec![BlockedTask {
                task_id: "b".into(),
                failed_dependency: "a".into()
            }]
        );
        assert_eq!(report.active_locks, vec!["d.lock".to_string()]);

        let rendered = report.to_string();
        assert!(rendered.contains("EXECUTION STATUS"));
        assert!(rendered.contains("Completed:        1 (50%)"));
        assert!(rendered.contains("FAILED TASKS (1)"));
        assert!(rendered.contains("  Error: HTTPError: 500"));
        assert!(rendered.contains("BLOCKED TASKS (1)"));
        assert!(rendered.contains("ACTIVE LOCKS (1)"));
        assert!(rendered.contains("paused"));
    }
}
