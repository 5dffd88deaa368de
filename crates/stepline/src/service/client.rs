//! StepFunctions trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error code the service returns once a task's heartbeat or overall timeout elapsed
pub const TASK_TIMED_OUT: &str = "TaskTimedOut";

/// Limit on a failure report's error name, in characters
pub const MAX_ERROR_CHARS: usize = 256;

/// Limit on a failure report's cause, in characters
pub const MAX_CAUSE_CHARS: usize = 32_768;

/// Limit on a success report's serialized output, in bytes
pub const MAX_OUTPUT_BYTES: usize = 262_144;

/// Error type for service operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The task already timed out (or was closed) on the service side
    #[error("task timed out: {0}")]
    TaskTimedOut(String),

    /// The task token is unknown to the service
    #[error("task does not exist: {0}")]
    TaskDoesNotExist(String),

    /// The activity ARN does not exist
    #[error("activity does not exist: {0}")]
    ActivityDoesNotExist(String),

    /// Any other error response from the service
    #[error("service error {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The request did not complete within its timeout
    #[error("request timed out")]
    Timeout,

    /// Transport-level failure
    #[error("http error: {0}")]
    Http(String),

    /// Request or response body could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ServiceError {
    /// Build an error from a service error code (the part after `#` in `__type`)
    pub fn from_code(status: u16, code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            TASK_TIMED_OUT => Self::TaskTimedOut(message),
            "TaskDoesNotExist" => Self::TaskDoesNotExist(message),
            "ActivityDoesNotExist" => Self::ActivityDoesNotExist(message),
            _ => Self::Api {
                status,
                code: code.to_string(),
                message,
            },
        }
    }

    /// Whether the service reported the task as already timed out
    pub fn is_task_timed_out(&self) -> bool {
        matches!(self, Self::TaskTimedOut(_))
    }

    /// Whether this is a client-side request timeout (expected on long polls)
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A task claimed from an activity queue
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityTask {
    /// Opaque token identifying this claim
    pub task_token: String,

    /// Task input
    pub input: serde_json::Value,
}

/// An activity known to the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityListItem {
    pub activity_arn: String,
    pub name: String,
    #[serde(with = "epoch_seconds")]
    pub creation_date: DateTime<Utc>,
}

/// Result of creating an activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedActivity {
    pub activity_arn: String,
    #[serde(with = "epoch_seconds")]
    pub creation_date: DateTime<Utc>,
}

/// Remote activity task service
///
/// This is the surface of AWS Step Functions the worker needs: claiming
/// tasks, reporting liveness and outcomes, and managing activities.
///
/// Implementations must be safe for concurrent use: the poller, heartbeat
/// and reporting paths all share one instance.
#[async_trait]
pub trait StepFunctions: Send + Sync + 'static {
    /// Long-poll for a task of the given activity
    ///
    /// Returns `Ok(None)` when the service's own long-poll window elapsed
    /// without a task becoming available.
    async fn get_activity_task(
        &self,
        activity_arn: &str,
        worker_name: &str,
    ) -> Result<Option<ActivityTask>, ServiceError>;

    /// Report that the task is still being worked on
    async fn send_task_heartbeat(&self, task_token: &str) -> Result<(), ServiceError>;

    /// Report successful completion with JSON-serialized output
    async fn send_task_success(&self, task_token: &str, output: &str) -> Result<(), ServiceError>;

    /// Report failure with an error name and cause text
    async fn send_task_failure(
        &self,
        task_token: &str,
        error: &str,
        cause: &str,
    ) -> Result<(), ServiceError>;

    /// Create (or return the existing) activity with this name
    async fn create_activity(&self, name: &str) -> Result<CreatedActivity, ServiceError>;

    /// Delete an activity
    async fn delete_activity(&self, activity_arn: &str) -> Result<(), ServiceError>;

    /// List all activities, following pagination
    async fn list_activities(&self) -> Result<Vec<ActivityListItem>, ServiceError>;
}

/// Serde support for timestamps as (fractional) epoch seconds
pub(crate) mod epoch_seconds {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(date.timestamp_millis() as f64 / 1000.0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        from_secs(secs)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", secs)))
    }

    pub fn from_secs(secs: f64) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
    }
}
