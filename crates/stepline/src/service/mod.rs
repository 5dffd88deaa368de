//! Remote activity task service
//!
//! This module provides:
//! - [`StepFunctions`] - the service operations the worker relies on
//! - [`HttpStepFunctions`] - AWS client over rusoto
//! - [`InMemoryStepFunctions`] - local double for tests and development

mod client;
mod http;
mod memory;

pub use client::{
    ActivityListItem, ActivityTask, CreatedActivity, ServiceError, StepFunctions, MAX_CAUSE_CHARS,
    MAX_ERROR_CHARS, MAX_OUTPUT_BYTES, TASK_TIMED_OUT,
};
pub use http::{HttpStepFunctions, POLL_TIMEOUT, REQUEST_TIMEOUT};
pub use memory::{InMemoryStepFunctions, TaskReport, TaskState, MEMORY_ACCOUNT_ID, MEMORY_REGION};
