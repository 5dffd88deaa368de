//! # Step Functions activity workers
//!
//! A client library for AWS Step Functions activities: workers long-poll
//! an activity's task queue, run a handler for each claimed task while
//! heartbeats keep the claim alive, and report exactly one outcome per task.
//!
//! ## Features
//!
//! - **Sequential execution**: a worker claims its next task only after the
//!   current one is reported
//! - **Concurrent heartbeats**: sent at the activity's interval for the
//!   handler's whole run; expiry abandons the task without a report
//! - **At-most-once reporting**: success, failure or cancellation, guarded
//!   against races between the handler, heartbeats and interrupts
//! - **Multi-activity processes**: [`WorkersManager`](worker::WorkersManager)
//!   runs one worker per activity with one execution at a time
//! - **Pluggable service**: AWS SDK client (rusoto), or an in-memory
//!   double for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Worker / WorkersManager                       │
//! │  (poll, execute, heartbeat, report)                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 StepFunctions (trait)                       │
//! │  HttpStepFunctions (AWS JSON 1.0)  │  InMemoryStepFunctions │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use stepline::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = Session::from_env()?;
//!
//!     let mut activities = ActivityRegistration::new("myPackage");
//!     activities.activity("Double", |_ctx, input| async move {
//!         Ok(json!({"result": input["x"].as_i64().unwrap_or(0) * 2}))
//!     })?;
//!     activities.register(&session).await?;
//!
//!     let manager = WorkersManager::new(activities.activities().to_vec(), None, session);
//!     manager.run().await?;
//!     Ok(())
//! }
//! ```

pub mod activity;
pub mod config;
pub mod naming;
pub mod service;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{
        Activity, ActivityContext, ActivityError, ActivityHandler, ActivityRegistration,
    };
    pub use crate::config::{AwsConfig, Session, WorkerConfig};
    pub use crate::service::{
        HttpStepFunctions, InMemoryStepFunctions, ServiceError, StepFunctions,
    };
    pub use crate::worker::{TaskOutcome, Worker, WorkerError, WorkersManager};

    pub use async_trait::async_trait;
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{json, Value};
}
