//! Per-task lock files.
//!
//! A lock is a small JSON file `{task_id, worker_id, started_at}` in the locks
//! directory. Holding the file means owning the task. Locks older than the
//! timeout are considered abandoned and may be taken over by anyone.
//!
//! Acquiring a free task is atomic: the lock body is written to a temporary
//! file and hard-linked into place, which fails if the lock already exists.
//! Taking over a stale or unreadable lock is a plain rename, so two workers
//! seizing the same stale lock at the same moment can both believe they won.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::util::{temp_sibling, write_atomic};
use crate::Result;

const LOCK_EXTENSION: &str = "lock";

/// Escaped ids longer than this are shortened to a prefix plus a hash of the
/// full id, keeping lock names (and their temp siblings) under the usual
/// 255-byte file name limit.
const MAX_ESCAPED_LEN: usize = 120;
const HASHED_PREFIX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lock {
    pub task_id: String,
    #[serde(rename = "worker_id")]
    pub owner_id: String,
    #[serde(rename = "started_at")]
    pub acquired_at: DateTime<Utc>,
}

impl Lock {
    pub fn new(task_id: &str, owner_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            owner_id: owner_id.to_string(),
            acquired_at: Utc::now(),
        }
    }

    /// Parse lock file contents. `None` means the file cannot be trusted.
    pub fn parse(contents: &str) -> Option<Self> {
        let raw: RawLock = serde_json::from_str(contents).ok()?;
        Some(Self {
            task_id: raw.task_id.unwrap_or_default(),
            owner_id: raw.worker_id.unwrap_or_default(),
            acquired_at: parse_timestamp(&raw.started_at?)?,
        })
    }
}

#[derive(Deserialize)]
struct RawLock {
    task_id: Option<String>,
    worker_id: Option<String>,
    started_at: Option<String>,
}

/// RFC 3339, or a naive ISO timestamp taken as UTC.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// What is on disk for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held(Lock),
    /// Present but abandoned. `None` when the file could not be parsed.
    Stale(Option<Lock>),
}

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    timeout: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Lock file for a task. Bytes outside `[A-Za-z0-9._-]` are
    /// percent-escaped so distinct ids never share a file. Long ids are
    /// cut to a prefix followed by `~` and a name-based UUID of the id.
    pub fn lock_path(&self, task_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", lock_stem(task_id), LOCK_EXTENSION))
    }

    /// Try to take the lock for `task_id`.
    ///
    /// Returns `true` when the caller now owns the task: either no lock
    /// existed, or the existing one was stale or unreadable. Returns `false`
    /// when a fresh lock is present, including one held by `owner_id` itself.
    ///
    /// # Errors
    /// Only on I/O failures unrelated to the lock's existence, such as an
    /// unwritable locks directory.
    pub fn try_acquire(&self, task_id: &str, owner_id: &str) -> Result<bool> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(task_id);
        let body = serde_json::to_string_pretty(&Lock::new(task_id, owner_id))?;

        // The holder may release between our failed create and our read;
        // one retry covers that window.
        for _ in 0..2 {
            if create_exclusive(&path, body.as_bytes())? {
                debug!(task_id = %task_id, owner = %owner_id, "lock acquired");
                return Ok(true);
            }

            match self.read_state(&path)? {
                LockState::Free => continue,
                LockState::Held(lock) => {
                    debug!(
                        task_id = %task_id,
                        owner = %owner_id,
                        holder = %lock.owner_id,
                        "lock held"
                    );
                    return Ok(false);
                }
                LockState::Stale(previous) => {
                    write_atomic(&path, body.as_bytes())?;
                    warn!(
                        task_id = %task_id,
                        owner = %owner_id,
                        previous_owner = previous.as_ref().map(|l| l.owner_id.as_str()).unwrap_or("unknown"),
                        "took over stale lock"
                    );
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Remove the lock for `task_id`. Absent locks are a no-op.
    pub fn release(&self, task_id: &str) -> Result<()> {
        match fs::remove_file(self.lock_path(task_id)) {
            Ok(()) => {
                debug!(task_id = %task_id, "lock released");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// A lock is stale once it is older than the timeout. Timestamps in the
    /// future are never stale.
    pub fn is_stale(&self, lock: &Lock, now: DateTime<Utc>) -> bool {
        match (now - lock.acquired_at).to_std() {
            Ok(age) => age > self.timeout,
            Err(_) => false,
        }
    }

    pub fn inspect(&self, task_id: &str) -> Result<LockState> {
        self.read_state(&self.lock_path(task_id))
    }

    fn read_state(&self, path: &Path) -> Result<LockState> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockState::Free),
            Err(e) if e.kind() == ErrorKind::InvalidData => return Ok(LockState::Stale(None)),
            Err(e) => return Err(e.into()),
        };
        Ok(match Lock::parse(&contents) {
            Some(lock) if self.is_stale(&lock, Utc::now()) => LockState::Stale(Some(lock)),
            Some(lock) => LockState::Held(lock),
            None => LockState::Stale(None),
        })
    }

    /// File names of every lock currently on disk, sorted.
    pub fn active_locks(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(LOCK_EXTENSION) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete every lock file. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize> {
        let names = self.active_locks()?;
        let mut removed = 0;
        for name in &names {
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(removed, "locks cleared");
        Ok(removed)
    }
}

/// Create `path` with `contents` only if it does not exist. The file appears
/// with its full contents or not at all.
fn create_exclusive(path: &Path, contents: &[u8]) -> Result<bool> {
    let tmp = temp_sibling(path);
    fs::write(&tmp, contents)?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => {
            // Filesystems without hard links: exclusive create, then fill.
            debug!(error = %e, "hard link unavailable, falling back to create_new");
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    file.write_all(contents)?;
                    Ok(true)
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }
}

fn lock_stem(task_id: &str) -> String {
    let escaped = escape_task_id(task_id);
    if escaped.len() <= MAX_ESCAPED_LEN {
        return escaped;
    }
    // `~` is never produced by escaping, so hashed stems cannot collide with
    // short ones. The escaped form is ASCII, so slicing is on a char boundary.
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, task_id.as_bytes());
    format!("{}~{}", &escaped[..HASHED_PREFIX_LEN], digest.simple())
}

fn escape_task_id(task_id: &str) -> String {
    let mut out = String::with_capacity(task_id.len());
    for byte in task_id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}
