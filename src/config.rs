use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Endpoint used by the HTTP executor when nothing else is configured.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8420";

/// Age after which a task lock may be seized by another worker.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;

pub const DEFAULT_EXECUTOR_TIMEOUT_SECS: u64 = 120;

pub const DEFAULT_MIN_BUDGET: f64 = 0.05;
pub const DEFAULT_MAX_BUDGET: f64 = 0.10;

/// Upper bound for `swarm start N`.
pub const MAX_WORKERS: usize = 32;

const API_URL_ENV: &str = "SWARM_API_URL";

/// Which executor backend workers hand tasks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Http,
    Claude,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Http => write!(f, "http"),
            ExecutorKind::Claude => write!(f, "claude"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_endpoint: String,
    pub lock_timeout_secs: u64,
    pub executor: ExecutorKind,
    pub command: Option<String>,
    pub executor_timeout_secs: u64,
    pub idle_sleep_ms: u64,
    pub max_idle_cycles: Option<u32>,
    pub default_min_budget: f64,
    pub default_max_budget: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_endpoint: DEFAULT_API_URL.to_string(),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            executor: ExecutorKind::default(),
            command: None,
            executor_timeout_secs: DEFAULT_EXECUTOR_TIMEOUT_SECS,
            idle_sleep_ms: 2000,
            max_idle_cycles: None,
            default_min_budget: DEFAULT_MIN_BUDGET,
            default_max_budget: DEFAULT_MAX_BUDGET,
        }
    }
}

impl Config {
    /// Load `swarm.toml` from the workspace, falling back to defaults when the
    /// file is absent. `SWARM_API_URL` overrides the configured endpoint.
    pub fn load(workspace: &Workspace) -> Result<Self> {
        let path = workspace.config_path();
        debug!(path = %path.display(), "Config::load");
        let config = if path.exists() {
            let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
            debug!(
                executor = %config.executor,
                api_endpoint = %config.api_endpoint,
                lock_timeout_secs = config.lock_timeout_secs,
                "config loaded"
            );
            config
        } else {
            debug!("config file not found, using defaults");
            Self::default()
        };
        Ok(config.with_api_override(std::env::var(API_URL_ENV).ok()))
    }

    pub fn save(&self, workspace: &Workspace) -> Result<()> {
        let path = workspace.config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Replace the endpoint when an override is present and non-blank.
    pub fn with_api_override(mut self, url: Option<String>) -> Self {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            self.api_endpoint = url.trim().to_string();
        }
        self
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_timeout_secs)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    /// Check the configuration at startup. All problems are reported at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        match reqwest::Url::parse(&self.api_endpoint) {
            Ok(url) => {
                if !matches!(url.scheme(), "http" | "https") {
                    errors.push(format!(
                        "api_endpoint must use http or https, got '{}'",
                        url.scheme()
                    ));
                }
                if url.host_str().map_or(true, str::is_empty) {
                    errors.push("api_endpoint must include a valid host".to_string());
                }
            }
            Err(e) => errors.push(format!("api_endpoint parse error: {}", e)),
        }

        if self.lock_timeout_secs == 0 {
            errors.push("lock_timeout_secs must be > 0".to_string());
        }
        if self.executor_timeout_secs == 0 {
            errors.push("executor_timeout_secs must be > 0".to_string());
        }
        if self.default_min_budget <= 0.0 {
            errors.push(format!(
                "default_min_budget must be > 0, got {}",
                self.default_min_budget
            ));
        }
        if self.default_max_budget < self.default_min_budget {
            errors.push(format!(
                "default_max_budget ({}) must be >= default_min_budget ({})",
                self.default_max_budget, self.default_min_budget
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            let listed: Vec<String> = errors
                .iter()
                .enumerate()
                .map(|(i, e)| format!("[{}] {}", i + 1, e))
                .collect();
            Err(Error::Config(listed.join("; ")))
        }
    }
}

/// All on-disk coordination state lives under one root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the workspace from an optional CLI argument, defaulting to the
    /// current directory.
    pub fn from_arg(arg: Option<&str>) -> Result<Self> {
        match arg {
            Some(dir) => Ok(Self::new(expand_tilde(dir))),
            None => Ok(Self::new(std::env::current_dir()?)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue_path(&self) -> PathBuf {
        self.root.join("queue.json")
    }

    pub fn execution_log_path(&self) -> PathBuf {
        self.root.join("execution_log.json")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("task_locks")
    }

    pub fn halt_path(&self) -> PathBuf {
        self.root.join("HALT")
    }

    pub fn pause_path(&self) -> PathBuf {
        self.root.join("PAUSE")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("swarm.log")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("swarm.toml")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        debug!(
            root = %self.root.display(),
            locks = %self.locks_dir().display(),
            "Workspace::ensure_dirs"
        );
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.locks_dir())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.exists() {
            return Err(Error::Config(format!(
                "Workspace directory does not exist: {}",
                self.root.display()
            )));
        }
        if !self.root.is_dir() {
            return Err(Error::Config(format!(
                "Workspace is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
