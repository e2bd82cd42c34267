//! `swarm` task runner library.
//!
//! Workers in separate processes share a file-backed queue (`store`) and
//! claim tasks through per-task lock files (`lock`); the `orchestrator`
//! administers the queue and supervises worker processes.
//!
//! Invariants:
//! - at most one lock file exists per task id
//! - a task is claimed only once its dependencies are completed
//! - queue and execution-log writes are atomic replaces

pub mod backend;
pub mod config;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod report;
pub mod store;
pub mod task;
pub mod worker;
