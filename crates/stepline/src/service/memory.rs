//! In-memory implementation of StepFunctions for testing

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::client::{
    ActivityListItem, ActivityTask, CreatedActivity, ServiceError, StepFunctions, MAX_CAUSE_CHARS,
    MAX_ERROR_CHARS, MAX_OUTPUT_BYTES, TASK_TIMED_OUT,
};
use crate::config::activity_arn;

/// Default region of the in-memory service
pub const MEMORY_REGION: &str = "us-east-1";

/// Default account of the in-memory service
pub const MEMORY_ACCOUNT_ID: &str = "123456789012";

/// Lifecycle of a task inside the in-memory service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Claimed,
    Succeeded,
    Failed,
    TimedOut,
}

/// A terminal report received by the service
#[derive(Debug, Clone, PartialEq)]
pub enum TaskReport {
    Success {
        task_token: String,
        output: String,
    },
    Failure {
        task_token: String,
        error: String,
        cause: String,
    },
}

impl TaskReport {
    /// Token of the reported task
    pub fn task_token(&self) -> &str {
        match self {
            Self::Success { task_token, .. } | Self::Failure { task_token, .. } => task_token,
        }
    }
}

type LatencyFn = Arc<dyn Fn(usize) -> Duration + Send + Sync>;

struct TaskRecord {
    activity_arn: String,
    input: serde_json::Value,
    state: TaskState,
    worker_name: Option<String>,
    heartbeats: Vec<Instant>,
    expire_at_heartbeat: Option<usize>,
    heartbeat_error: Option<String>,
}

struct ActivityRecord {
    name: String,
    creation_date: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    activities: BTreeMap<String, ActivityRecord>,
    queues: HashMap<String, VecDeque<String>>,
    tasks: HashMap<String, TaskRecord>,
    reports: Vec<TaskReport>,
    polls: HashMap<String, usize>,
    poll_error: Option<String>,
    heartbeat_latency: Option<LatencyFn>,
}

/// In-memory implementation of StepFunctions
///
/// Holds per-activity task queues and records every heartbeat and terminal
/// report, with knobs to script expiry, errors and latency. Long polls wait
/// for a task to be enqueued or for the long-poll window to elapse, using
/// tokio time so tests can run with a paused clock.
///
/// # Example
///
/// ```
/// use stepline::service::InMemoryStepFunctions;
///
/// let service = InMemoryStepFunctions::new();
/// let arn = service.activity_arn("spam");
/// let token = service.enqueue_task(&arn, serde_json::json!({"x": 7}));
/// assert_eq!(service.pending_tasks(&arn), 1);
/// # let _ = token;
/// ```
pub struct InMemoryStepFunctions {
    region: String,
    account_id: String,
    long_poll: Duration,
    state: Mutex<State>,
    task_added: Notify,
}

impl Default for InMemoryStepFunctions {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStepFunctions {
    /// Create a new in-memory service with a 60 second long-poll window
    pub fn new() -> Self {
        Self {
            region: MEMORY_REGION.to_string(),
            account_id: MEMORY_ACCOUNT_ID.to_string(),
            long_poll: Duration::from_secs(60),
            state: Mutex::new(State::default()),
            task_added: Notify::new(),
        }
    }

    /// Set how long a poll waits for a task before returning empty
    pub fn with_long_poll(mut self, window: Duration) -> Self {
        self.long_poll = window;
        self
    }

    /// Region used in generated ARNs
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Account used in generated ARNs
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// ARN the service gives an activity with this name
    pub fn activity_arn(&self, name: &str) -> String {
        activity_arn(&self.region, &self.account_id, name)
    }

    /// Queue a task for an activity, returning its token
    pub fn enqueue_task(&self, activity_arn: &str, input: serde_json::Value) -> String {
        let token = format!("token-{}", Uuid::now_v7());
        {
            let mut state = self.state.lock();
            state.tasks.insert(
                token.clone(),
                TaskRecord {
                    activity_arn: activity_arn.to_string(),
                    input,
                    state: TaskState::Queued,
                    worker_name: None,
                    heartbeats: Vec::new(),
                    expire_at_heartbeat: None,
                    heartbeat_error: None,
                },
            );
            state
                .queues
                .entry(activity_arn.to_string())
                .or_default()
                .push_back(token.clone());
        }
        self.task_added.notify_waiters();
        token
    }

    /// Make the `n`th heartbeat (1-based) of a task answer `TaskTimedOut`
    pub fn expire_at_heartbeat(&self, task_token: &str, n: usize) {
        if let Some(task) = self.state.lock().tasks.get_mut(task_token) {
            task.expire_at_heartbeat = Some(n);
        }
    }

    /// Time a task out immediately
    pub fn expire_task(&self, task_token: &str) {
        if let Some(task) = self.state.lock().tasks.get_mut(task_token) {
            task.state = TaskState::TimedOut;
        }
    }

    /// Make every heartbeat of a task fail with the given error code
    pub fn fail_heartbeats(&self, task_token: &str, code: &str) {
        if let Some(task) = self.state.lock().tasks.get_mut(task_token) {
            task.heartbeat_error = Some(code.to_string());
        }
    }

    /// Make the next poll (of any activity) fail with the given error code
    pub fn fail_next_poll(&self, code: &str) {
        self.state.lock().poll_error = Some(code.to_string());
        self.task_added.notify_waiters();
    }

    /// Delay each heartbeat response; the closure receives the heartbeat number (1-based)
    pub fn set_heartbeat_latency<F>(&self, latency: F)
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        self.state.lock().heartbeat_latency = Some(Arc::new(latency));
    }

    /// All terminal reports, in arrival order
    pub fn reports(&self) -> Vec<TaskReport> {
        self.state.lock().reports.clone()
    }

    /// Terminal reports for one task
    pub fn reports_for(&self, task_token: &str) -> Vec<TaskReport> {
        self.state
            .lock()
            .reports
            .iter()
            .filter(|r| r.task_token() == task_token)
            .cloned()
            .collect()
    }

    /// Times at which heartbeats for a task were received
    pub fn heartbeats(&self, task_token: &str) -> Vec<Instant> {
        self.state
            .lock()
            .tasks
            .get(task_token)
            .map(|t| t.heartbeats.clone())
            .unwrap_or_default()
    }

    /// Current state of a task
    pub fn task_state(&self, task_token: &str) -> Option<TaskState> {
        self.state.lock().tasks.get(task_token).map(|t| t.state)
    }

    /// Name of the worker that claimed a task
    pub fn claimed_by(&self, task_token: &str) -> Option<String> {
        self.state
            .lock()
            .tasks
            .get(task_token)
            .and_then(|t| t.worker_name.clone())
    }

    /// Number of tasks waiting to be claimed for an activity
    pub fn pending_tasks(&self, activity_arn: &str) -> usize {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Queued && t.activity_arn == activity_arn)
            .count()
    }

    /// Number of poll requests received for an activity
    pub fn poll_count(&self, activity_arn: &str) -> usize {
        self.state
            .lock()
            .polls
            .get(activity_arn)
            .copied()
            .unwrap_or(0)
    }

    fn try_claim(
        &self,
        activity_arn: &str,
        worker_name: &str,
    ) -> Result<Option<ActivityTask>, ServiceError> {
        let mut state = self.state.lock();
        if let Some(code) = state.poll_error.take() {
            return Err(ServiceError::from_code(400, &code, "scripted poll failure"));
        }

        let State { queues, tasks, .. } = &mut *state;
        let Some(queue) = queues.get_mut(activity_arn) else {
            return Ok(None);
        };
        while let Some(token) = queue.pop_front() {
            let Some(task) = tasks.get_mut(&token) else {
                continue;
            };
            if task.state != TaskState::Queued {
                continue;
            }
            task.state = TaskState::Claimed;
            task.worker_name = Some(worker_name.to_string());
            return Ok(Some(ActivityTask {
                task_token: token,
                input: task.input.clone(),
            }));
        }
        Ok(None)
    }

    fn close_task(&self, task_token: &str, report: TaskReport) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(task_token)
            .ok_or_else(|| ServiceError::TaskDoesNotExist(task_token.to_string()))?;
        if task.state != TaskState::Claimed {
            return Err(ServiceError::TaskTimedOut(format!(
                "task is {:?}",
                task.state
            )));
        }
        task.state = match report {
            TaskReport::Success { .. } => TaskState::Succeeded,
            TaskReport::Failure { .. } => TaskState::Failed,
        };
        state.reports.push(report);
        Ok(())
    }
}

fn too_long(field: &str, length: usize, limit: usize) -> ServiceError {
    ServiceError::Api {
        status: 400,
        code: "ValidationException".to_string(),
        message: format!("{} length {} exceeds the limit of {}", field, length, limit),
    }
}

#[async_trait]
impl StepFunctions for InMemoryStepFunctions {
    async fn get_activity_task(
        &self,
        activity_arn: &str,
        worker_name: &str,
    ) -> Result<Option<ActivityTask>, ServiceError> {
        *self
            .state
            .lock()
            .polls
            .entry(activity_arn.to_string())
            .or_default() += 1;

        let deadline = Instant::now() + self.long_poll;
        loop {
            let notified = self.task_added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_claim(activity_arn, worker_name)? {
                return Ok(Some(task));
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn send_task_heartbeat(&self, task_token: &str) -> Result<(), ServiceError> {
        let (count, latency) = {
            let mut state = self.state.lock();
            let latency = state.heartbeat_latency.clone();
            let task = state
                .tasks
                .get_mut(task_token)
                .ok_or_else(|| ServiceError::TaskDoesNotExist(task_token.to_string()))?;
            task.heartbeats.push(Instant::now());
            (task.heartbeats.len(), latency)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency(count)).await;
        }

        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(task_token)
            .ok_or_else(|| ServiceError::TaskDoesNotExist(task_token.to_string()))?;
        if let Some(code) = &task.heartbeat_error {
            return Err(ServiceError::from_code(400, code, "scripted heartbeat failure"));
        }
        if task.expire_at_heartbeat == Some(count) && task.state == TaskState::Claimed {
            task.state = TaskState::TimedOut;
        }
        match task.state {
            TaskState::Claimed => Ok(()),
            other => Err(ServiceError::from_code(
                400,
                TASK_TIMED_OUT,
                format!("task is {:?}", other),
            )),
        }
    }

    async fn send_task_success(&self, task_token: &str, output: &str) -> Result<(), ServiceError> {
        if output.len() > MAX_OUTPUT_BYTES {
            return Err(too_long("output", output.len(), MAX_OUTPUT_BYTES));
        }
        serde_json::from_str::<serde_json::Value>(output)?;
        self.close_task(
            task_token,
            TaskReport::Success {
                task_token: task_token.to_string(),
                output: output.to_string(),
            },
        )
    }

    async fn send_task_failure(
        &self,
        task_token: &str,
        error: &str,
        cause: &str,
    ) -> Result<(), ServiceError> {
        let error_chars = error.chars().count();
        if error_chars > MAX_ERROR_CHARS {
            return Err(too_long("error", error_chars, MAX_ERROR_CHARS));
        }
        let cause_chars = cause.chars().count();
        if cause_chars > MAX_CAUSE_CHARS {
            return Err(too_long("cause", cause_chars, MAX_CAUSE_CHARS));
        }
        self.close_task(
            task_token,
            TaskReport::Failure {
                task_token: task_token.to_string(),
                error: error.to_string(),
                cause: cause.to_string(),
            },
        )
    }

    async fn create_activity(&self, name: &str) -> Result<CreatedActivity, ServiceError> {
        let arn = self.activity_arn(name);
        let mut state = self.state.lock();
        let record = state
            .activities
            .entry(arn.clone())
            .or_insert_with(|| ActivityRecord {
                name: name.to_string(),
                creation_date: Utc::now(),
            });
        Ok(CreatedActivity {
            activity_arn: arn,
            creation_date: record.creation_date,
        })
    }

    async fn delete_activity(&self, activity_arn: &str) -> Result<(), ServiceError> {
        self.state.lock().activities.remove(activity_arn);
        Ok(())
    }

    async fn list_activities(&self) -> Result<Vec<ActivityListItem>, ServiceError> {
        Ok(self
            .state
            .lock()
            .activities
            .iter()
            .map(|(arn, record)| ActivityListItem {
                activity_arn: arn.clone(),
                name: record.name.clone(),
                creation_date: record.creation_date,
            })
            .collect())
    }
}
