//! Worker loop tests against a real workspace.

use std::fs;
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use swarm::config::Config;
use swarm::coordination::{ExitReason, KillSwitch, LockState, WorkerOptions};
use swarm::core::Task;
use swarm::status::StatusReport;
use swarm::store::{EntryStatus, LogEntry};

use crate::fixtures::{draining, independent_tasks, reversed_chain, ScriptedExecutor, TestWorkspace};

/// Given a queue listing dependents before their dependencies
/// When one worker drains it
/// Then tasks still execute in dependency order
#[tokio::test]
async fn test_worker_respects_dependency_order() {
    let ws = TestWorkspace::with_tasks(reversed_chain());
    let executor = Arc::new(ScriptedExecutor::new());

    let report = ws
        .worker(executor.clone(), draining(2))
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.exit_reason, ExitReason::Idle);
    assert_eq!(report.completed, 3);
    assert_eq!(executor.calls(), vec!["a", "b", "c"]);

    let log = ws.log_doc();
    assert_eq!(log.swarm_summary.total_tasks, 3);
    assert_eq!(log.swarm_summary.completed, 3);
    assert!(ws.locks().active_locks().unwrap().is_empty());
}

#[tokio::test]
async fn test_max_iterations_limits_executed_tasks() {
    let ws = TestWorkspace::with_tasks(independent_tasks(5));
    let executor = Arc::new(ScriptedExecutor::new());
    let options = WorkerOptions {
        max_iterations: Some(2),
        ..draining(10)
    };

    let report = ws
        .worker(executor.clone(), options)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.exit_reason, ExitReason::IterationLimit);
    assert_eq!(report.iterations, 2);
    assert_eq!(executor.calls(), vec!["task_000", "task_001"]);
    assert_eq!(ws.log_doc().swarm_summary.completed, 2);
}

/// Given a task whose dependency fails
/// When the worker drains the queue
/// Then the dependent never runs and status reports it as blocked
#[tokio::test]
async fn test_failed_dependency_blocks_dependent() {
    let ws = TestWorkspace::with_tasks(vec![
        Task::new("build"),
        Task::new("deploy").with_dependencies(["build"]),
        Task::new("docs"),
    ]);
    let executor = Arc::new(ScriptedExecutor::new().failing(["build"]));

    let report = ws
        .worker(executor.clone(), draining(2))
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(executor.calls(), vec!["build", "docs"]);

    let log = ws.log_doc();
    assert_eq!(log.status_of("build"), Some(EntryStatus::Failed));
    assert_eq!(
        log.get("build").unwrap().errors.as_deref(),
        Some("TaskFailed: build exploded")
    );
    assert_eq!(log.status_of("deploy"), None);

    let status = StatusReport::gather(&ws.workspace, &ws.config).unwrap();
    assert_eq!(status.blocked.len(), 1);
    assert_eq!(status.blocked[0].task_id, "deploy");
    assert_eq!(status.failed[0].task_id, "build");
}

#[tokio::test]
async fn test_halt_stops_after_current_task() {
    let ws = TestWorkspace::with_tasks(independent_tasks(3));
    let halt_path = ws.workspace.halt_path();
    let executor = Arc::new(ScriptedExecutor::new().with_hook(move |_task| {
        fs::write(&halt_path, "operator stop").unwrap();
    }));

    let report = ws
        .worker(executor.clone(), draining(5))
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.exit_reason, ExitReason::Halted);
    assert_eq!(executor.calls(), vec!["task_000"]);
    // The interrupted iteration still recorded its result.
    assert_eq!(ws.log_doc().status_of("task_000"), Some(EntryStatus::Completed));
}

#[tokio::test]
async fn test_resume_after_pause() {
    let ws = TestWorkspace::with_tasks(independent_tasks(1));
    let kill_switch = KillSwitch::new(&ws.workspace);
    kill_switch.pause("deploy window").unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    let paused = ws
        .worker(executor.clone(), draining(2))
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(paused.executed, 0);

    kill_switch.resume().unwrap();
    let resumed = ws
        .worker(executor.clone(), draining(1))
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.executed, 1);
    assert_eq!(executor.calls(), vec!["task_000"]);
}

#[tokio::test]
async fn test_completed_entries_are_not_rerun() {
    let ws = TestWorkspace::with_tasks(independent_tasks(2));
    ws.log()
        .record(LogEntry::new("task_000", EntryStatus::Completed))
        .unwrap();
    ws.log()
        .record(LogEntry::new("task_001", EntryStatus::Failed))
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    let report = ws
        .worker(executor.clone(), draining(1))
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.executed, 0);
    assert!(executor.calls().is_empty());
}

/// Given a lock left behind by a crashed worker long ago
/// When a new worker scans
/// Then it takes the lock over and runs the task
#[tokio::test]
async fn test_stale_lock_is_taken_over() {
    let ws = TestWorkspace::with_tasks(vec![Task::new("orphaned")]);
    let started_at = (Utc::now() - ChronoDuration::hours(2)).to_rfc3339();
    fs::write(
        ws.locks().lock_path("orphaned"),
        format!(
            r#"{{"task_id": "orphaned", "worker_id": "worker-dead", "started_at": "{}"}}"#,
            started_at
        ),
    )
    .unwrap();
    assert!(matches!(
        ws.locks().inspect("orphaned").unwrap(),
        LockState::Stale(Some(_))
    ));

    let executor = Arc::new(ScriptedExecutor::new());
    let report = ws
        .worker(executor.clone(), draining(1))
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(executor.calls(), vec!["orphaned"]);
    assert_eq!(ws.locks().inspect("orphaned").unwrap(), LockState::Free);
}

#[tokio::test]
async fn test_fresh_foreign_lock_is_respected() {
    let ws = TestWorkspace::with_tasks(vec![Task::new("busy"), Task::new("free")]);
    assert!(ws.locks().try_acquire("busy", "worker-elsewhere").unwrap());

    let executor = Arc::new(ScriptedExecutor::new());
    ws.worker(executor.clone(), draining(1))
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(executor.calls(), vec!["free"]);
    match ws.locks().inspect("busy").unwrap() {
        LockState::Held(lock) => assert_eq!(lock.owner_id, "worker-elsewhere"),
        other => panic!("expected held lock, got {:?}", other),
    }
}

/// The lock on disk while a task runs names the worker that holds it.
#[tokio::test]
async fn test_lock_file_names_executing_worker() {
    let ws = TestWorkspace::with_tasks(vec![Task::new("observed")]);
    let seen = Arc::new(Mutex::new(None));
    let locks = ws.locks();
    let seen_in_hook = Arc::clone(&seen);
    let executor = Arc::new(ScriptedExecutor::new().with_hook(move |task| {
        let contents = fs::read_to_string(locks.lock_path(&task.id)).unwrap();
        *seen_in_hook.lock().unwrap() = Some(contents);
    }));

    let worker = ws.worker(executor, draining(1));
    let worker_id = worker.worker_id().to_string();
    worker.run(&CancellationToken::new()).await.unwrap();

    let contents = seen.lock().unwrap().clone().expect("hook did not run");
    let json: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(json["task_id"], "observed");
    assert_eq!(json["worker_id"], worker_id.as_str());
    assert!(json["started_at"].is_string());

    let entry = ws.log_doc().get("observed").cloned().unwrap();
    assert_eq!(entry.worker_id.as_deref(), Some(worker_id.as_str()));
}

#[tokio::test]
async fn test_cancellation_interrupts_idle_sleep() {
    let ws = TestWorkspace::new();
    let executor = Arc::new(ScriptedExecutor::new());
    let options = WorkerOptions {
        max_iterations: None,
        max_idle_cycles: None,
        idle_sleep: std::time::Duration::from_secs(3600),
    };
    let worker = ws.worker(executor, options);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(std::time::Duration::from_secs(10), worker.run(&cancel))
        .await
        .expect("worker ignored cancellation")
        .unwrap();
    assert_eq!(report.exit_reason, ExitReason::Cancelled);
    assert!(report.idle_cycles >= 1);
}

#[test]
fn test_config_defaults_drive_worker_options() {
    let config = Config::default();
    let options = WorkerOptions::from_config(&config);
    assert_eq!(options.idle_sleep, config.idle_sleep());
    assert_eq!(options.max_idle_cycles, None);
    assert_eq!(options.max_iterations, None);
}
