//! Several workers sharing one workspace.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use swarm::coordination::LockManager;
use swarm::store::EntryStatus;

use crate::fixtures::{diamond, draining, independent_tasks, ScriptedExecutor, TestWorkspace};

/// Given 4 workers and 16 independent tasks
/// When they drain the queue concurrently
/// Then no task is ever executing on two workers at once and every task
/// ends up completed
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_never_overlap() {
    let ws = TestWorkspace::with_tasks(independent_tasks(16));
    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(20)));
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let worker = ws.worker(executor.clone(), draining(5));
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { worker.run(&cancel).await }));
    }

    let mut worker_ids = HashSet::new();
    let mut executed = 0;
    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        worker_ids.insert(report.worker_id.clone());
        executed += report.executed;
    }

    assert_eq!(worker_ids.len(), 4, "worker ids must be unique");
    assert_eq!(executor.overlaps(), 0);

    let ran: HashSet<String> = executor.calls().into_iter().collect();
    assert_eq!(ran.len(), 16);
    assert!(executed >= 16);

    let log = ws.log_doc();
    for i in 0..16 {
        let id = format!("task_{:03}", i);
        assert_eq!(log.status_of(&id), Some(EntryStatus::Completed), "{}", id);
    }
    assert!(ws.locks().active_locks().unwrap().is_empty());
}

/// Dependencies hold across workers too: no dependent starts before every
/// one of its dependencies has been executed.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn test_concurrent_workers_respect_dependencies() {
    let ws = TestWorkspace::with_tasks(diamond());
    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(10)));
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let worker = ws.worker(executor.clone(), draining(5));
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { worker.run(&cancel).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let calls = executor.calls();
    let first = |id: &str| calls.iter().position(|c| c == id).unwrap();
    assert_eq!(first("a"), 0);
    assert!(first("d") > first("b"));
    assert!(first("d") > first("c"));
    assert_eq!(ws.log_doc().status_of("d"), Some(EntryStatus::Completed));
}

/// Racing threads on one free task: exactly one wins.
#[test]
fn test_racing_acquires_single_winner() {
    let ws = TestWorkspace::new();
    let dir = ws.workspace.locks_dir();

    for round in 0..10 {
        let task_id = format!("contended_{}", round);
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let dir = dir.clone();
                    let task_id = task_id.clone();
                    scope.spawn(move || {
                        LockManager::new(dir, Duration::from_secs(300))
                            .try_acquire(&task_id, &format!("worker-{}", i))
                            .unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(winners, 1, "round {}", round);
    }
}

#[test]
fn test_release_is_idempotent_and_frees_task() {
    let ws = TestWorkspace::new();
    let locks = ws.locks();

    assert!(locks.try_acquire("t", "worker-1").unwrap());
    assert!(!locks.try_acquire("t", "worker-1").unwrap());
    assert!(!locks.try_acquire("t", "worker-2").unwrap());

    locks.release("t").unwrap();
    locks.release("t").unwrap();
    assert!(locks.try_acquire("t", "worker-2").unwrap());
}
