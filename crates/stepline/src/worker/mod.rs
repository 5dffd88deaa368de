//! Activity workers
//!
//! This module provides:
//! - [`Worker`] - polls for and executes the tasks of one activity
//! - [`WorkersManager`] - several workers in one process, one task at a time
//! - [`TaskPoller`] - long-polling task claimer with pause/resume/stop
//! - [`TaskExecution`] - runs one task with concurrent heartbeats
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkersManager                        │
//! │        (execution slot shared by the workers' hooks)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Worker (per activity)                   │
//! │  ┌─────────────┐    pre-hook: take slot, pause siblings     │
//! │  │ TaskPoller  │    post-hook: resume siblings, free slot   │
//! │  │ (long poll) │                                            │
//! │  └──────┬──────┘                                            │
//! │         ▼                                                   │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  TaskExecution                      │    │
//! │  │  [handler task]            [heartbeat task]         │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!       success / failure / cancellation (at most one per task)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use stepline::prelude::*;
//!
//! let session = Session::from_env()?;
//! let double = Activity::new("double", |_ctx, input| async move {
//!     Ok(json!({"result": input["x"].as_i64().unwrap_or(0) * 2}))
//! });
//!
//! let worker = Worker::new(double, None, session);
//! worker.run().await?;
//! ```

mod activity_worker;
mod execution;
mod manager;
mod poller;

pub use activity_worker::{ExecuteHook, StopHandle, Worker, WorkerError, WorkerStatus};
pub use execution::{
    ExecutionError, TaskExecution, TaskOutcome, TerminalGuard, CANCELLED_CAUSE, CANCELLED_ERROR,
    OUTPUT_ERROR, PANIC_ERROR,
};
pub use manager::WorkersManager;
pub use poller::{PollerError, TaskPoller};
