//! Cross-process stop signals.
//!
//! Workers share no memory, so shutdown is signalled with sentinel files in
//! the workspace: `HALT` asks every worker to exit, `PAUSE` makes them idle
//! until the file is removed. The file body, if readable, is the reason.

use chrono::Utc;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::Workspace;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltState {
    Running,
    Paused { reason: String },
    Halted { reason: String },
}

impl HaltState {
    pub fn is_running(&self) -> bool {
        matches!(self, HaltState::Running)
    }
}

impl std::fmt::Display for HaltState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltState::Running => write!(f, "running"),
            HaltState::Paused { reason } => write!(f, "paused ({})", reason),
            HaltState::Halted { reason } => write!(f, "halted ({})", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KillSwitch {
    halt_path: PathBuf,
    pause_path: PathBuf,
}

impl KillSwitch {
    pub fn new(workspace: &Workspace) -> Self {
        Self {
            halt_path: workspace.halt_path(),
            pause_path: workspace.pause_path(),
        }
    }

    pub fn halt(&self, reason: &str) -> Result<()> {
        write_sentinel(&self.halt_path, reason)?;
        info!(reason = %reason, "halt requested");
        Ok(())
    }

    pub fn pause(&self, reason: &str) -> Result<()> {
        write_sentinel(&self.pause_path, reason)?;
        info!(reason = %reason, "pause requested");
        Ok(())
    }

    /// Remove both sentinels.
    pub fn resume(&self) -> Result<()> {
        remove_if_present(&self.pause_path)?;
        remove_if_present(&self.halt_path)?;
        info!("resumed");
        Ok(())
    }

    pub fn clear_halt(&self) -> Result<()> {
        remove_if_present(&self.halt_path)
    }

    /// Current state. HALT wins over PAUSE.
    pub fn check(&self) -> HaltState {
        if let Some(reason) = read_sentinel(&self.halt_path) {
            return HaltState::Halted { reason };
        }
        if let Some(reason) = read_sentinel(&self.pause_path) {
            return HaltState::Paused { reason };
        }
        HaltState::Running
    }
}

fn write_sentinel(path: &Path, reason: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n{}\n", reason, Utc::now().to_rfc3339()))?;
    Ok(())
}

/// `Some(reason)` when the sentinel exists, even if its body is unreadable.
fn read_sentinel(path: &Path) -> Option<String> {
    if !path.exists() {
        return None;
    }
    let reason = fs::read_to_string(path)
        .ok()
        .and_then(|body| body.lines().next().map(|l| l.trim().to_string()))
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| "no reason given".to_string());
    Some(reason)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
