//! Claude Code headless executor.
//!
//! Runs `claude -p <prompt> --output-format json` for each task and maps the
//! JSON result onto the executor boundary.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::Config;
use crate::core::Task;
use crate::error::{Error, Result};
use crate::orchestration::executor::{
    ExecutionFailure, ExecutionResult, ExecutionSuccess, Executor,
};
use crate::util::truncate;

/// The result type from a Claude execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultType {
    Success { output: String },
    Error { message: String },
}

/// Response from a Claude headless execution.
#[derive(Debug, Clone)]
pub struct ClaudeResponse {
    pub session_id: Option<String>,
    pub result: ResultType,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
}

impl ClaudeResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.result, ResultType::Success { .. })
    }

    pub fn output(&self) -> Option<&str> {
        match &self.result {
            ResultType::Success { output } => Some(output),
            ResultType::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.result {
            ResultType::Success { .. } => None,
            ResultType::Error { message } => Some(message),
        }
    }

    fn into_execution_result(self) -> ExecutionResult {
        match self.result {
            ResultType::Success { output } => {
                Ok(ExecutionSuccess::new(output).with_cost(self.cost_usd))
            }
            ResultType::Error { message } => Err(ExecutionFailure::new("ClaudeError", message)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClaudeResponse {
    subtype: Option<String>,
    result: Option<String>,
    session_id: Option<String>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    num_turns: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

/// Executes tasks through the Claude CLI in non-interactive mode.
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    binary: PathBuf,
    /// Arguments placed before `-p`, e.g. permission flags.
    extra_args: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
}

impl ClaudeExecutor {
    /// Build from the configured command line. The first word is resolved on
    /// `PATH`; the rest are passed through.
    ///
    /// # Errors
    ///
    /// Returns `Error::ExecutorNotAvailable` if the binary cannot be found.
    pub fn from_config(config: &Config, cwd: &Path) -> Result<Self> {
        let mut words = config.effective_command().split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| Error::Config("executor command is empty".to_string()))?;
        let binary = which::which(program)
            .map_err(|e| Error::ExecutorNotAvailable(format!("{}: {}", program, e)))?;
        Ok(Self {
            binary,
            extra_args: words.map(str::to_string).collect(),
            cwd: cwd.to_path_buf(),
            timeout: config.executor_timeout(),
        })
    }

    /// Use a specific binary path, skipping `PATH` lookup.
    pub fn with_binary(binary: PathBuf, cwd: &Path) -> Self {
        Self {
            binary,
            extra_args: Vec::new(),
            cwd: cwd.to_path_buf(),
            timeout: Duration::from_secs(crate::config::DEFAULT_EXECUTOR_TIMEOUT_SECS),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Prompt sent for a task.
    pub fn prompt_for(task: &Task) -> String {
        let instruction = task.instruction();
        if instruction.is_empty() {
            format!("Complete task '{}' ({}).", task.id, task.kind)
        } else {
            format!("Task '{}' ({}):\n{}", task.id, task.kind, instruction)
        }
    }

    /// Execute a prompt and parse the response.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The command fails to spawn
    /// - The command times out
    pub async fn run_prompt(&self, prompt: &str) -> Result<ClaudeResponse> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(&self.extra_args)
                .arg("-p")
                .arg(prompt)
                .arg("--output-format")
                .arg("json")
                .current_dir(&self.cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(Error::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Ok(response) = Self::parse_json_response(&stdout) {
            return Ok(response);
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "claude exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Ok(ClaudeResponse {
                session_id: None,
                result: ResultType::Error { message },
                cost_usd: None,
                duration_ms: None,
                num_turns: None,
            });
        }

        Ok(ClaudeResponse {
            session_id: None,
            result: ResultType::Success {
                output: stdout.trim().to_string(),
            },
            cost_usd: None,
            duration_ms: None,
            num_turns: None,
        })
    }

    /// Parse a JSON response from Claude.
    pub fn parse_json_response(json_str: &str) -> Result<ClaudeResponse> {
        let raw: RawClaudeResponse = serde_json::from_str(json_str)?;

        let result = match raw.subtype.as_deref() {
            Some("success") => ResultType::Success {
                output: raw.result.unwrap_or_default(),
            },
            Some("error") => ResultType::Error {
                message: raw.error.or(raw.result).unwrap_or_default(),
            },
            _ => {
                if let Some(error) = raw.error {
                    ResultType::Error { message: error }
                } else if let Some(result) = raw.result {
                    ResultType::Success { output: result }
                } else {
                    ResultType::Error {
                        message: "Unknown response format".to_string(),
                    }
                }
            }
        };

        Ok(ClaudeResponse {
            session_id: raw.session_id,
            result,
            cost_usd: raw.total_cost_usd,
            duration_ms: raw.duration_ms,
            num_turns: raw.num_turns,
        })
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    fn name(&self) -> &str {
        "claude"
    }

    async fn execute(&self, task: &Task) -> ExecutionResult {
        debug!(task_id = %task.id, binary = %self.binary.display(), "running claude");
        match self.run_prompt(&Self::prompt_for(task)).await {
            Ok(response) => response.into_execution_result(),
            Err(Error::Timeout(d)) => Err(ExecutionFailure::new(
                "Timeout",
                format!("claude did not finish within {:?}", d),
            )),
            Err(e) => Err(ExecutionFailure::new(
                "SpawnError",
                truncate(&e.to_string(), 500),
            )),
        }
    }
}
