//! Task Store: the shared `queue.json` document.
//!
//! The document is always read whole and replaced whole. Concurrent writers
//! race and the last one wins; the coordination core never writes the queue
//! while workers run, only the CLI does.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::Task;
use crate::util::write_json_atomic;
use crate::{Error, Result};

pub const QUEUE_VERSION: &str = "1.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub completed: Vec<Value>,
    #[serde(default)]
    pub failed: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueueDocument {
    /// Empty queue bound to an API endpoint.
    pub fn empty(api_endpoint: &str) -> Self {
        Self {
            version: Some(QUEUE_VERSION.to_string()),
            api_endpoint: Some(api_endpoint.to_string()),
            ..Self::default()
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.get(task_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the queue. A missing (or blank) file is an empty queue.
    ///
    /// # Errors
    /// Returns `Error::Json` if the file exists but is not a valid queue.
    pub fn read(&self) -> Result<QueueDocument> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "queue file not found, using empty queue");
            return Ok(QueueDocument::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(QueueDocument::default());
        }
        let doc: QueueDocument = serde_json::from_str(&contents)?;
        debug!(tasks = doc.tasks.len(), "queue loaded");
        Ok(doc)
    }

    /// Replace the whole queue document.
    pub fn write(&self, doc: &QueueDocument) -> Result<()> {
        write_json_atomic(&self.path, doc)?;
        debug!(path = %self.path.display(), tasks = doc.tasks.len(), "queue saved");
        Ok(())
    }

    /// Validate and append a task.
    ///
    /// # Errors
    /// - `Error::Validation` if the task is malformed
    /// - `Error::DuplicateTask` if the id is already queued
    pub fn add_task(&self, task: Task, api_endpoint: &str) -> Result<()> {
        task.validate()?;
        let mut doc = self.read()?;
        if doc.contains(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        if doc.version.is_none() {
            doc.version = Some(QUEUE_VERSION.to_string());
        }
        if doc.api_endpoint.is_none() {
            doc.api_endpoint = Some(api_endpoint.to_string());
        }
        info!(task_id = %task.id, kind = %task.kind, deps = task.depends_on.len(), "task added");
        doc.tasks.push(task);
        self.write(&doc)
    }

    /// Reset to an empty queue.
    pub fn clear(&self, api_endpoint: &str) -> Result<()> {
        info!(path = %self.path.display(), "queue cleared");
        self.write(&QueueDocument::empty(api_endpoint))
    }
}
