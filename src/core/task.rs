//! Task record shared by the Task Store, the workers and the wave scheduler.
//!
//! Only the declared fields are interpreted by the coordination core. Any
//! other keys found in `queue.json` are kept in [`Task::extra`] and written
//! back untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

pub const DEFAULT_TASK_TYPE: &str = "grind";

/// How hard the executor should work on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Intensity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intensity::Low => write!(f, "low"),
            Intensity::Medium => write!(f, "medium"),
            Intensity::High => write!(f, "high"),
        }
    }
}

/// A single unit of work.
///
/// Tasks are identified by their string `id` and may name prerequisite task
/// ids in `depends_on`. The coordination core never mutates a task; progress
/// is recorded in the execution log instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Executor role, serialized as `type`.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<Intensity>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default = "default_parallel_safe")]
    pub parallel_safe: bool,
    /// Keys the coordination core does not inspect.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_kind() -> String {
    DEFAULT_TASK_TYPE.to_string()
}

fn default_parallel_safe() -> bool {
    true
}

impl Task {
    /// Create a `grind` task with the given id and no dependencies.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: default_kind(),
            description: None,
            min_budget: None,
            max_budget: None,
            intensity: None,
            depends_on: Vec::new(),
            status: None,
            parallel_safe: true,
            extra: Map::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_budget(mut self, min: f64, max: f64) -> Self {
        self.min_budget = Some(min);
        self.max_budget = Some(max);
        self
    }

    pub fn with_intensity(mut self, intensity: Intensity) -> Self {
        self.intensity = Some(intensity);
        self
    }

    /// The instruction text for the executor.
    ///
    /// Older queue files store it under `task` or `atomic_instruction`
    /// instead of `description`.
    pub fn instruction(&self) -> &str {
        if let Some(desc) = self.description.as_deref().filter(|d| !d.is_empty()) {
            return desc;
        }
        ["task", "atomic_instruction"]
            .iter()
            .find_map(|key| self.extra.get(*key).and_then(Value::as_str))
            .unwrap_or("")
    }

    /// Budget bounds, falling back to the given defaults for missing values.
    pub fn budget_range(&self, default_min: f64, default_max: f64) -> (f64, f64) {
        (
            self.min_budget.unwrap_or(default_min),
            self.max_budget.unwrap_or(default_max),
        )
    }

    pub fn intensity_or_default(&self) -> Intensity {
        self.intensity.unwrap_or(Intensity::Medium)
    }

    /// Setup-time validation. Runs before a task is accepted into a queue or
    /// a schedule, never during execution.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("Task ID cannot be empty".to_string()));
        }
        if self.kind.trim().is_empty() {
            return Err(Error::Validation(format!(
                "Task '{}' has an empty type",
                self.id
            )));
        }
        if let Some(min) = self.min_budget {
            if min <= 0.0 {
                return Err(Error::Validation(format!(
                    "Task '{}': min_budget must be positive (got {})",
                    self.id, min
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_budget, self.max_budget) {
            if max < min {
                return Err(Error::Validation(format!(
                    "Task '{}': max_budget ({}) must be >= min_budget ({})",
                    self.id, max, min
                )));
            }
        }
        if self.depends_on.iter().any(|dep| dep == &self.id) {
            return Err(Error::Validation(format!(
                "Task '{}' cannot depend on itself",
                self.id
            )));
        }
        Ok(())
    }
}

/// Where a task stands inside one wave-scheduler run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskOutcome {
    /// Not yet dispatched.
    Pending,
    /// Dispatched in the current wave.
    Running,
    Completed {
        result_summary: String,
    },
    Failed {
        error: String,
    },
    /// A dependency failed, so this task can never run.
    Blocked {
        by: String,
    },
    /// Never dispatched because the run was cancelled.
    Skipped,
}

impl TaskOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskOutcome::Pending | TaskOutcome::Running)
    }
}

impl Default for TaskOutcome {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Pending => write!(f, "pending"),
            TaskOutcome::Running => write!(f, "running"),
            TaskOutcome::Completed { .. } => write!(f, "completed"),
            TaskOutcome::Failed { error } => write!(f, "failed: {}", error),
            TaskOutcome::Blocked { by } => write!(f, "blocked by {}", by),
            TaskOutcome::Skipped => write!(f, "skipped"),
        }
    }
}
