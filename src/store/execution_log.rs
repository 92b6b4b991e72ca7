//! Execution Log: the authoritative record of task outcomes,
//! `execution_log.json`.
//!
//! Statuses only move forward. Once an entry is `completed` or `failed` no
//! later write replaces it, so a worker that lost a lock race cannot undo
//! another worker's result. The `swarm_summary` block is derived from the
//! entries and recomputed on every write.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::util::write_json_atomic;
use crate::Result;

pub const LOG_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InProgress => "in_progress",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task's record in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Serialized as `id`; filled from the map key when absent.
    #[serde(rename = "id", default)]
    pub task_id: String,
    pub status: EntryStatus,
    #[serde(default)]
    pub result_summary: String,
    #[serde(default)]
    pub errors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// RFC 3339 timestamps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogEntry {
    pub fn new(task_id: &str, status: EntryStatus) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            result_summary: String::new(),
            errors: None,
            worker_id: None,
            started_at: None,
            completed_at: None,
            cost_usd: None,
            extra: Map::new(),
        }
    }

    /// Entry written when a worker begins executing a task.
    pub fn in_progress(task_id: &str, worker_id: &str) -> Self {
        Self {
            worker_id: Some(worker_id.to_string()),
            started_at: Some(now_rfc3339()),
            ..Self::new(task_id, EntryStatus::InProgress)
        }
    }

    /// Mark the entry completed.
    pub fn complete(mut self, result_summary: &str, cost_usd: Option<f64>) -> Self {
        self.status = EntryStatus::Completed;
        self.result_summary = result_summary.to_string();
        self.errors = None;
        self.cost_usd = cost_usd;
        self.completed_at = Some(now_rfc3339());
        self
    }

    /// Mark the entry failed with an error message.
    pub fn fail(mut self, error: &str) -> Self {
        self.status = EntryStatus::Failed;
        self.errors = Some(error.to_string());
        self.completed_at = Some(now_rfc3339());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSummary {
    pub total_tasks: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub failed: usize,
}

/// Result of a monotonic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Written,
    /// The existing entry was terminal and was left as is.
    Ignored { existing: EntryStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogDocument {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, LogEntry>,
    #[serde(default)]
    pub swarm_summary: SwarmSummary,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version() -> String {
    LOG_VERSION.to_string()
}

impl Default for ExecutionLogDocument {
    fn default() -> Self {
        Self {
            version: default_version(),
            start_time: None,
            tasks: BTreeMap::new(),
            swarm_summary: SwarmSummary::default(),
            extra: Map::new(),
        }
    }
}

impl ExecutionLogDocument {
    pub fn status_of(&self, task_id: &str) -> Option<EntryStatus> {
        self.tasks.get(task_id).map(|e| e.status)
    }

    pub fn get(&self, task_id: &str) -> Option<&LogEntry> {
        self.tasks.get(task_id)
    }

    /// Insert or replace an entry unless the existing one is terminal.
    pub fn upsert(&mut self, entry: LogEntry) -> Recorded {
        if let Some(existing) = self.tasks.get(&entry.task_id) {
            if existing.status.is_terminal() {
                return Recorded::Ignored {
                    existing: existing.status,
                };
            }
        }
        self.tasks.insert(entry.task_id.clone(), entry);
        Recorded::Written
    }

    pub fn recompute_summary(&mut self) -> SwarmSummary {
        let mut summary = SwarmSummary {
            total_tasks: self.tasks.len(),
            ..SwarmSummary::default()
        };
        for entry in self.tasks.values() {
            match entry.status {
                EntryStatus::Completed => summary.completed += 1,
                EntryStatus::InProgress => summary.in_progress += 1,
                EntryStatus::Pending => summary.pending += 1,
                EntryStatus::Failed => summary.failed += 1,
            }
        }
        self.swarm_summary = summary;
        summary
    }

    pub fn entries_with_status(&self, status: EntryStatus) -> Vec<&LogEntry> {
        self.tasks.values().filter(|e| e.status == status).collect()
    }

    fn backfill_ids(&mut self) {
        for (key, entry) in self.tasks.iter_mut() {
            if entry.task_id.is_empty() {
                entry.task_id = key.clone();
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionLog {
    path: PathBuf,
}

impl ExecutionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the log. A missing (or blank) file is an empty log.
    pub fn read(&self) -> Result<ExecutionLogDocument> {
        if !self.path.exists() {
            return Ok(ExecutionLogDocument::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(ExecutionLogDocument::default());
        }
        let mut doc: ExecutionLogDocument = serde_json::from_str(&contents)?;
        doc.backfill_ids();
        Ok(doc)
    }

    /// Recompute the summary and replace the whole document.
    pub fn write(&self, doc: &mut ExecutionLogDocument) -> Result<()> {
        let summary = doc.recompute_summary();
        write_json_atomic(&self.path, doc)?;
        debug!(
            total = summary.total_tasks,
            completed = summary.completed,
            in_progress = summary.in_progress,
            failed = summary.failed,
            "execution log saved"
        );
        Ok(())
    }

    /// Read-modify-write a single entry, honouring monotonic status.
    pub fn record(&self, entry: LogEntry) -> Result<Recorded> {
        let mut doc = self.read()?;
        let task_id = entry.task_id.clone();
        let status = entry.status;
        let outcome = doc.upsert(entry);
        match outcome {
            Recorded::Written => {
                self.write(&mut doc)?;
                debug!(task_id = %task_id, status = %status, "log entry recorded");
            }
            Recorded::Ignored { existing } => {
                warn!(
                    task_id = %task_id,
                    attempted = %status,
                    existing = %existing,
                    "refusing to overwrite terminal log entry"
                );
            }
        }
        Ok(outcome)
    }

    /// Create the log with a start time if it does not exist yet.
    pub fn initialize(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        let mut doc = ExecutionLogDocument {
            start_time: Some(now_rfc3339()),
            ..ExecutionLogDocument::default()
        };
        self.write(&mut doc)?;
        info!(path = %self.path.display(), "execution log initialized");
        Ok(())
    }

    /// Replace the log with an empty document.
    pub fn reset(&self) -> Result<()> {
        self.write(&mut ExecutionLogDocument::default())?;
        info!(path = %self.path.display(), "execution log reset");
        Ok(())
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
