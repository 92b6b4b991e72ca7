//! Structured logging for swarm.
//!
//! Two sinks are installed:
//! - human-readable lines on stderr, so stdout stays free for command output
//! - JSON lines appended to `<workspace>/swarm.log`, one record per event
//!
//! Level priority:
//! 1. `--debug` flag or `SWARM_DEBUG=1` selects DEBUG
//! 2. `SWARM_LOG` env filter (e.g. "info", "swarm::coordination=debug")
//! 3. default to INFO

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Workspace;
use crate::{Error, Result};

const DEBUG_ENV: &str = "SWARM_DEBUG";
const FILTER_ENV: &str = "SWARM_LOG";
const LOG_FILE: &str = "swarm.log";

/// Keeps the background file writer alive. Dropping it flushes pending records.
pub struct LogGuard {
    _file: WorkerGuard,
}

/// Initialize logging with explicit debug mode setting.
///
/// Call once at startup; a second call returns `Error::Config`.
pub fn init_with_debug(workspace: &Workspace, debug: bool) -> Result<LogGuard> {
    let debug_enabled = debug || env_flag(std::env::var(DEBUG_ENV).ok().as_deref());
    let directive = filter_directive(debug_enabled, std::env::var(FILTER_ENV).ok());
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| Error::Config(format!("invalid log filter '{}': {}", directive, e)))?;

    std::fs::create_dir_all(workspace.root())?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE)
        .build(workspace.root())
        .map_err(|e| Error::Config(format!("cannot open {}: {}", LOG_FILE, e)))?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(
            fmt::layer()
                .json()
                .with_writer(file_writer)
                .with_current_span(false),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    Ok(LogGuard { _file: guard })
}

fn env_flag(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn filter_directive(debug: bool, env_filter: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    env_filter
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_flag() {
        assert!(env_flag(Some("1")));
        assert!(env_flag(Some("TRUE")));
        assert!(env_flag(Some("true")));
        assert!(!env_flag(Some("0")));
        assert!(!env_flag(Some("")));
        assert!(!env_flag(None));
    }

    #[test]
    fn test_filter_directive_priority() {
        assert_eq!(filter_directive(true, Some("warn".into())), "debug");
        assert_eq!(filter_directive(false, Some("warn".into())), "warn");
        assert_eq!(filter_directive(false, Some("  ".into())), "info");
        assert_eq!(filter_directive(false, None), "info");
    }

    #[test]
    fn test_filter_directive_parses() {
        let directive = filter_directive(false, Some("swarm::coordination=debug".into()));
        assert!(EnvFilter::try_new(directive).is_ok());
    }
}
