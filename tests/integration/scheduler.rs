//! Wave scheduling of task files.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use swarm::core::{Task, TaskDAG, TaskOutcome};
use swarm::orchestration::{load_tasks, SchedulerEvent, WaveScheduler};
use swarm::Error;

use crate::fixtures::{diamond, ScriptedExecutor, TestWorkspace};

/// A queue written by `swarm add` can be scheduled in-process as is.
#[tokio::test]
async fn test_schedule_queue_file() {
    let ws = TestWorkspace::with_tasks(diamond());
    let tasks = load_tasks(&ws.workspace.queue_path()).unwrap();
    let dag = TaskDAG::from_tasks(tasks).unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    let report = WaveScheduler::new(4)
        .run(&dag, executor.clone(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.waves.len(), 3);
    assert_eq!(report.waves[0], vec!["a"]);
    let mut middle = report.waves[1].clone();
    middle.sort();
    assert_eq!(middle, vec!["b", "c"]);
    assert_eq!(report.waves[2], vec!["d"]);
    assert_eq!(executor.calls().len(), 4);
}

/// Given a failure in the middle of a diamond
/// When the schedule runs
/// Then the join is reported as blocked and the sibling still completes
#[tokio::test]
async fn test_failure_blocks_join_not_sibling() {
    let dag = TaskDAG::from_tasks(diamond()).unwrap();
    let executor = Arc::new(ScriptedExecutor::new().failing(["b"]));
    let (tx, mut rx) = mpsc::channel(32);

    let report = WaveScheduler::new(2)
        .with_events(tx)
        .run(&dag, executor.clone(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.completed, vec!["a", "c"]);
    assert_eq!(report.failed, vec!["b"]);
    assert_eq!(report.blocked, vec!["d"]);
    assert_eq!(
        report.outcomes["d"],
        TaskOutcome::Blocked { by: "b".to_string() }
    );
    assert!(!executor.calls().contains(&"d".to_string()));

    let mut blocked_events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SchedulerEvent::TaskBlocked { task_id, by } = event {
            blocked_events.push((task_id, by));
        }
    }
    assert_eq!(blocked_events, vec![("d".to_string(), "b".to_string())]);
}

#[tokio::test]
async fn test_auto_detected_dependencies_shape_waves() {
    let ws = TestWorkspace::new();
    let path = ws.workspace.root().join("plan.json");
    fs::write(
        &path,
        r#"[
            {"id": "report", "description": "Summarise results after analyse"},
            {"id": "fetch", "description": "Download the dataset"},
            {"id": "analyse", "description": "Crunch numbers; requires fetch"}
        ]"#,
    )
    .unwrap();

    let mut dag = TaskDAG::from_tasks(load_tasks(&path).unwrap()).unwrap();
    assert_eq!(dag.detect_dependencies(), 2);

    let report = WaveScheduler::new(4)
        .run(&dag, Arc::new(ScriptedExecutor::new()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.waves,
        vec![vec!["fetch"], vec!["analyse"], vec!["report"]]
    );
}

#[test]
fn test_cyclic_task_file_rejected() {
    let tasks = vec![
        Task::new("x").with_dependencies(["z"]),
        Task::new("y").with_dependencies(["x"]),
        Task::new("z").with_dependencies(["y"]),
    ];
    match TaskDAG::from_tasks(tasks) {
        Err(Error::DependencyCycle(ids)) => assert_eq!(ids, "x, y, z"),
        Err(other) => panic!("expected cycle error, got {}", other),
        Ok(_) => panic!("expected cycle error"),
    }
}

#[tokio::test]
async fn test_cancelled_schedule_skips_remaining_waves() {
    let dag = TaskDAG::from_tasks(diamond()).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_delay(Duration::from_millis(5))
            .with_hook(move |task| {
                if task.id == "a" {
                    trigger.cancel();
                }
            }),
    );

    let report = WaveScheduler::new(4)
        .run(&dag, executor.clone(), &cancel)
        .await
        .unwrap();

    assert_eq!(report.completed, vec!["a"]);
    assert_eq!(report.skipped, vec!["b", "c", "d"]);
    assert_eq!(executor.calls(), vec!["a"]);
}
