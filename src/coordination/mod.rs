//! Cross-process coordination: lock files, the dependency gate, stop
//! sentinels and the worker loop built on them.

pub mod gate;
pub mod halt;
pub mod lock;
pub mod worker;

pub use halt::{HaltState, KillSwitch};
pub use lock::{Lock, LockManager, LockState};
pub use worker::{ExitReason, ScanOutcome, Worker, WorkerOptions, WorkerReport};
