//! Execution of a single claimed task
//!
//! Runs the activity handler while a second task keeps the claim alive with
//! heartbeats, and sends exactly one terminal report unless the task
//! expired first.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::activity::{Activity, ActivityContext, ActivityError, ActivityResult};
use crate::service::{
    ActivityTask, ServiceError, StepFunctions, MAX_CAUSE_CHARS, MAX_ERROR_CHARS, MAX_OUTPUT_BYTES,
};

/// Error name of the report sent for a cancelled task
pub const CANCELLED_ERROR: &str = "WorkerCancel";

/// Cause of the report sent for a cancelled task
pub const CANCELLED_CAUSE: &str = "Activity execution cancelled by the worker. This could be due \
     to an interrupt during execution, or the worker was stopped after the task was claimed.";

/// Error name of the report sent when a handler panics
pub const PANIC_ERROR: &str = "Panic";

/// Error name of the report sent when the handler's output is too large
pub const OUTPUT_ERROR: &str = "OutputError";

/// Execution errors
///
/// All of these end the worker: task-level problems (handler failures,
/// expiry) are outcomes, not errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The activity has no handler
    #[error("activity '{0}' cannot be executed")]
    NotCallable(String),

    /// A heartbeat failed for a reason other than task expiry
    #[error("heartbeat failed: {0}")]
    Heartbeat(#[source] ServiceError),

    /// The terminal report could not be delivered
    #[error("failed to report task outcome: {0}")]
    Report(#[source] ServiceError),

    /// The heartbeat task ended abnormally
    #[error("heartbeat task failed: {0}")]
    HeartbeatTask(String),
}

/// How a task execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Success reported
    Succeeded,
    /// Failure reported with this error name
    Failed { error: String },
    /// Cancellation reported
    Cancelled,
    /// The task was already closed on the service side; nothing reported
    Expired,
}

/// At-most-once latch for the terminal report
#[derive(Debug, Default)]
pub struct TerminalGuard(AtomicBool);

impl TerminalGuard {
    /// Create an unclaimed guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the right to finish the task; true for exactly one caller
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the guard has been claimed
    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

enum Report {
    Success(serde_json::Value),
    Failure { error: String, cause: String },
    Cancelled,
}

enum Completion {
    Interrupted,
    Finished(Result<ActivityResult, JoinError>),
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatExit {
    Stopped,
    Expired,
}

/// Lifecycle of one claimed task
///
/// Created per claim and never reused: [`run`](Self::run) consumes it.
pub struct TaskExecution {
    activity: Activity,
    task: ActivityTask,
    service: Arc<dyn StepFunctions>,
    guard: Arc<TerminalGuard>,
    stop: CancellationToken,
    interrupt: CancellationToken,
}

impl TaskExecution {
    /// Create an execution for a claimed task
    pub fn new(activity: Activity, task: ActivityTask, service: Arc<dyn StepFunctions>) -> Self {
        Self {
            activity,
            task,
            service,
            guard: Arc::new(TerminalGuard::new()),
            stop: CancellationToken::new(),
            interrupt: CancellationToken::new(),
        }
    }

    /// Token of the executed task
    pub fn task_token(&self) -> &str {
        &self.task.task_token
    }

    /// Activity being executed
    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Token that, when cancelled, abandons the handler and reports cancellation
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Whether a terminal report was sent (or skipped because the task expired)
    pub fn is_finished(&self) -> bool {
        self.guard.is_claimed()
    }

    /// Execute the task and report its outcome
    ///
    /// # Errors
    ///
    /// Fails if the activity has no handler, a heartbeat fails for a reason
    /// other than expiry, or the report cannot be delivered.
    #[instrument(
        skip(self),
        fields(activity = %self.activity.name(), task_token = %self.task.task_token)
    )]
    pub async fn run(self) -> Result<TaskOutcome, ExecutionError> {
        let ctx = ActivityContext::new(
            self.activity.name(),
            self.task.task_token.clone(),
            self.stop.child_token(),
        );
        let call = self
            .activity
            .call(ctx, self.task.input.clone())
            .ok_or_else(|| ExecutionError::NotCallable(self.activity.name().to_string()))?;

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.service),
            self.task.task_token.clone(),
            self.activity.heartbeat(),
            Arc::clone(&self.guard),
            self.stop.clone(),
        ));

        let started = Instant::now();
        let mut handler = tokio::spawn(call);

        let completion = tokio::select! {
            biased;
            _ = self.interrupt.cancelled() => Completion::Interrupted,
            joined = &mut handler => Completion::Finished(joined),
            _ = self.stop.cancelled() => Completion::Stopped,
        };

        let report = match completion {
            Completion::Interrupted => {
                info!("Execution interrupted");
                Some(Report::Cancelled)
            }
            Completion::Finished(joined) => {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Handler finished");
                Some(report_for(joined))
            }
            Completion::Stopped => None,
        };

        if !handler.is_finished() {
            self.stop.cancel();
            handler.abort();
        }

        let outcome = match report {
            Some(report) => Some(self.send(report).await),
            None => None,
        };

        self.stop.cancel();
        let heartbeat_exit = match heartbeat.await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => return Err(ExecutionError::Heartbeat(e)),
            Err(e) => return Err(ExecutionError::HeartbeatTask(e.to_string())),
        };

        match outcome {
            Some(outcome) => outcome,
            None => {
                if heartbeat_exit == HeartbeatExit::Expired {
                    warn!("Task expired during execution, abandoning it");
                }
                Ok(TaskOutcome::Expired)
            }
        }
    }

    /// Report the task cancelled without running the handler
    #[instrument(
        skip(self),
        fields(activity = %self.activity.name(), task_token = %self.task.task_token)
    )]
    pub async fn report_cancelled(&self) -> Result<TaskOutcome, ExecutionError> {
        let outcome = self.send(Report::Cancelled).await;
        self.stop.cancel();
        outcome
    }

    async fn send(&self, report: Report) -> Result<TaskOutcome, ExecutionError> {
        if !self.guard.try_claim() {
            warn!("Skipping report, task already finished");
            return Ok(TaskOutcome::Expired);
        }

        let token = &self.task.task_token;
        let (result, outcome) = match within_limits(report) {
            Report::Success(output) => {
                debug!(output = %output, "Reporting task success");
                let output = output.to_string();
                (
                    self.service.send_task_success(token, &output).await,
                    TaskOutcome::Succeeded,
                )
            }
            Report::Failure { error, cause } => {
                info!(error = %error, "Reporting task failure");
                debug!(cause = %cause, "Failure cause");
                (
                    self.service.send_task_failure(token, &error, &cause).await,
                    TaskOutcome::Failed { error },
                )
            }
            Report::Cancelled => {
                info!("Reporting task cancelled");
                (
                    self.service
                        .send_task_failure(token, CANCELLED_ERROR, CANCELLED_CAUSE)
                        .await,
                    TaskOutcome::Cancelled,
                )
            }
        };

        match result {
            Ok(()) => Ok(outcome),
            Err(e) if e.is_task_timed_out() => {
                warn!(error = %e, "Task expired before its outcome was reported");
                Ok(TaskOutcome::Expired)
            }
            Err(e) => {
                error!(error = %e, "Failed to report task outcome");
                Err(ExecutionError::Report(e))
            }
        }
    }
}

impl std::fmt::Debug for TaskExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecution")
            .field("activity", &self.activity.name())
            .field("task_token", &self.task.task_token)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn report_for(joined: Result<ActivityResult, JoinError>) -> Report {
    match joined {
        Ok(Ok(output)) => Report::Success(output),
        Ok(Err(ActivityError::Cancelled)) => Report::Cancelled,
        Ok(Err(ActivityError::Failed { error, cause })) => Report::Failure { error, cause },
        Err(e) if e.is_panic() => Report::Failure {
            error: PANIC_ERROR.to_string(),
            cause: panic_message(e.into_panic()),
        },
        Err(_) => Report::Cancelled,
    }
}

/// Fit a report into the service's field limits
///
/// Oversized error names and causes are truncated; an oversized output is
/// replaced by a failure, since a cut-off JSON document is not valid output.
fn within_limits(report: Report) -> Report {
    match report {
        Report::Success(output) => {
            let size = output.to_string().len();
            if size <= MAX_OUTPUT_BYTES {
                return Report::Success(output);
            }
            warn!(size, limit = MAX_OUTPUT_BYTES, "Task output too large, reporting failure");
            Report::Failure {
                error: OUTPUT_ERROR.to_string(),
                cause: format!(
                    "task output is {} bytes, over the {} byte limit",
                    size, MAX_OUTPUT_BYTES
                ),
            }
        }
        Report::Failure { error, cause } => Report::Failure {
            error: truncate_chars(error, MAX_ERROR_CHARS),
            cause: truncate_chars(cause, MAX_CAUSE_CHARS),
        },
        Report::Cancelled => Report::Cancelled,
    }
}

fn truncate_chars(mut text: String, max: usize) -> String {
    if let Some((end, _)) = text.char_indices().nth(max) {
        text.truncate(end);
    }
    text
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

async fn heartbeat_loop(
    service: Arc<dyn StepFunctions>,
    task_token: String,
    interval: Duration,
    guard: Arc<TerminalGuard>,
    stop: CancellationToken,
) -> Result<HeartbeatExit, ServiceError> {
    loop {
        let started = Instant::now();

        let sent = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(HeartbeatExit::Stopped),
            sent = service.send_task_heartbeat(&task_token) => sent,
        };

        match sent {
            Ok(()) => trace!(task_token = %task_token, "Heartbeat sent"),
            Err(e) if e.is_task_timed_out() => {
                stop.cancel();
                if guard.try_claim() {
                    warn!(task_token = %task_token, "Task timed out");
                    return Ok(HeartbeatExit::Expired);
                }
                return Ok(HeartbeatExit::Stopped);
            }
            Err(e) => {
                error!(task_token = %task_token, error = %e, "Heartbeat failed");
                stop.cancel();
                return Err(e);
            }
        }

        let wait = interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = stop.cancelled() => return Ok(HeartbeatExit::Stopped),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
