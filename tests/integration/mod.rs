//! Integration test suite for swarm.
//!
//! These tests drive workers, locks and the wave scheduler against real
//! temporary workspaces. Executors are scripted, so no network or external
//! CLI is needed.
//!
//! # Test Categories
//!
//! - `worker_loop`: single worker against a shared workspace
//! - `locking`: several workers racing over one queue
//! - `scheduler`: in-process wave scheduling from task files

mod fixtures;

mod locking;
mod scheduler;
mod worker_loop;
