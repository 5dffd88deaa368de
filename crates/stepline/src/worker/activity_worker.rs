//! Worker polling for and executing the tasks of one activity

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::execution::{ExecutionError, TaskExecution, TaskOutcome};
use super::poller::{PollerError, TaskPoller};
use crate::activity::Activity;
use crate::config::{ConfigError, Session, WorkerConfig};
use crate::naming::{default_worker_name, validate_name, NameError};
use crate::service::ActivityTask;

/// Callback run before or after each task execution
pub type ExecuteHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Constructed, not started
    Created,
    /// Waiting for a task
    Polling,
    /// Running a task
    Executing,
    /// Finishing: no new tasks are taken
    Stopping,
    /// Loop exited
    Stopped,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The activity has no handler
    #[error("activity '{0}' cannot be executed")]
    NotCallable(String),

    /// Worker name rejected by the service's naming rules
    #[error("invalid worker name: {0}")]
    InvalidName(#[from] NameError),

    /// The worker was already started
    #[error("worker is already started")]
    AlreadyStarted,

    /// The worker was never started
    #[error("worker is not started")]
    NotStarted,

    /// Configuration error (e.g. the activity ARN could not be resolved)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Polling failed
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// Task execution failed
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// The worker loop panicked (e.g. in an execute hook)
    #[error("worker loop panicked: {0}")]
    Panicked(String),
}

struct WorkerInner {
    activity: Activity,
    name: String,
    session: Session,
    config: WorkerConfig,
    poller: Arc<TaskPoller>,
    finish: CancellationToken,
    status: watch::Sender<WorkerStatus>,
    pre_execute_hooks: RwLock<Vec<ExecuteHook>>,
    post_execute_hooks: RwLock<Vec<ExecuteHook>>,
    current: Mutex<Option<CancellationToken>>,
    hooks_pending: AtomicBool,
    result: Mutex<Option<Result<(), WorkerError>>>,
}

/// Worker for one activity
///
/// Polls for tasks of its activity and executes them one at a time,
/// sending heartbeats while each runs.
///
/// # Example
///
/// ```ignore
/// use stepline::prelude::*;
///
/// let activity = Activity::new("spam", |_ctx, input| async move {
///     Ok(json!({"result": input["x"]}))
/// });
///
/// let worker = Worker::new(activity, None, Session::from_env()?);
///
/// // Poll and execute until Ctrl-C
/// worker.run().await?;
/// ```
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Create a worker; `name` defaults to `{host}-{8 hex chars}`
    pub fn new(activity: Activity, name: Option<String>, session: Session) -> Self {
        Self::with_config(activity, name, session, WorkerConfig::default())
    }

    /// Create a worker with explicit tuning
    pub fn with_config(
        activity: Activity,
        name: Option<String>,
        session: Session,
        config: WorkerConfig,
    ) -> Self {
        let name = name.unwrap_or_else(default_worker_name);
        let poller = Arc::new(TaskPoller::new(
            Arc::clone(session.service()),
            name.clone(),
        ));
        let (status, _) = watch::channel(WorkerStatus::Created);

        Self {
            inner: Arc::new(WorkerInner {
                activity,
                name,
                session,
                config,
                poller,
                finish: CancellationToken::new(),
                status,
                pre_execute_hooks: RwLock::new(Vec::new()),
                post_execute_hooks: RwLock::new(Vec::new()),
                current: Mutex::new(None),
                hooks_pending: AtomicBool::new(false),
                result: Mutex::new(None),
            }),
        }
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Activity executed by this worker
    pub fn activity(&self) -> &Activity {
        &self.inner.activity
    }

    /// Current status
    pub fn status(&self) -> WorkerStatus {
        *self.inner.status.borrow()
    }

    /// Whether [`end`](Self::end) was requested
    pub fn is_finishing(&self) -> bool {
        self.inner.finish.is_cancelled()
    }

    /// Add a callback run before each task execution
    pub fn add_pre_execute_hook<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let hook: ExecuteHook = Arc::new(move || Box::pin(hook()));
        self.inner.pre_execute_hooks.write().push(hook);
    }

    /// Add a callback run after each task execution
    pub fn add_post_execute_hook<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let hook: ExecuteHook = Arc::new(move || Box::pin(hook()));
        self.inner.post_execute_hooks.write().push(hook);
    }

    /// Get a handle that can end this worker from anywhere
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn poller(&self) -> &Arc<TaskPoller> {
        &self.inner.poller
    }

    pub(crate) fn downgrade(&self) -> WeakWorker {
        WeakWorker(Arc::downgrade(&self.inner))
    }

    /// Start polling
    ///
    /// # Errors
    ///
    /// Fails without spawning anything if the activity has no handler, the
    /// worker name is invalid, the activity ARN cannot be resolved, or the
    /// worker was already started.
    #[instrument(skip(self), fields(worker = %self.inner.name, activity = %self.inner.activity.name()))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        if self.status() != WorkerStatus::Created {
            return Err(WorkerError::AlreadyStarted);
        }
        if !self.inner.activity.is_callable() {
            return Err(WorkerError::NotCallable(
                self.inner.activity.name().to_string(),
            ));
        }
        validate_name(&self.inner.name)?;

        let activity_arn = self
            .inner
            .session
            .activity_arn(self.inner.activity.name())
            .await?;

        let started = self.inner.status.send_if_modified(|status| {
            if *status == WorkerStatus::Created {
                *status = WorkerStatus::Polling;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(WorkerError::AlreadyStarted);
        }

        if let Err(e) = self.inner.poller.start(activity_arn) {
            self.inner.status.send_replace(WorkerStatus::Stopped);
            return Err(e.into());
        }

        info!("Starting polling");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = AssertUnwindSafe(worker_loop(Arc::clone(&inner)))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(WorkerError::Panicked(panic_message(panic))));
            inner.finish_loop(result).await;
        });
        Ok(())
    }

    /// Wait for the worker loop to exit, ending the worker on Ctrl-C
    ///
    /// The first Ctrl-C lets the current task finish; a second one cancels
    /// it, reporting the task as cancelled.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the loop.
    pub async fn join(&self) -> Result<(), WorkerError> {
        let wait = self.wait();
        tokio::pin!(wait);
        let mut listen = true;

        loop {
            tokio::select! {
                result = &mut wait => return result,
                signal = tokio::signal::ctrl_c(), if listen => match signal {
                    Ok(()) if !self.is_finishing() => {
                        info!(worker = %self.inner.name, "Interrupt received, finishing");
                        self.end();
                    }
                    Ok(()) => {
                        warn!(worker = %self.inner.name, "Second interrupt, cancelling execution");
                        self.interrupt();
                    }
                    Err(e) => {
                        warn!(error = %e, "Cannot listen for interrupts");
                        listen = false;
                    }
                },
            }
        }
    }

    /// Wait for the worker loop to exit
    ///
    /// The loop's error is returned to the first waiter only.
    pub async fn wait(&self) -> Result<(), WorkerError> {
        let mut status = self.inner.status.subscribe();
        if *status.borrow() == WorkerStatus::Created {
            return Err(WorkerError::NotStarted);
        }
        let _ = status.wait_for(|s| *s == WorkerStatus::Stopped).await;
        self.inner.result.lock().take().unwrap_or(Ok(()))
    }

    /// Stop taking new tasks; the current one (if any) finishes
    ///
    /// Idempotent.
    pub fn end(&self) {
        self.inner.end();
    }

    /// Cancel the task currently executing, reporting it cancelled
    pub fn interrupt(&self) {
        if let Some(token) = self.inner.current.lock().as_ref() {
            token.cancel();
        }
    }

    /// Abort the in-flight poll and block polling until [`allow_poll`](Self::allow_poll)
    pub async fn cancel_poll(&self) {
        debug!(worker = %self.inner.name, "Cancelling polling");
        self.inner.poller.pause();
        self.inner.poller.quiesced().await;
    }

    /// Resume polling blocked by [`cancel_poll`](Self::cancel_poll)
    pub fn allow_poll(&self) {
        debug!(worker = %self.inner.name, "Resuming polling");
        self.inner.poller.unpause();
    }

    /// Start, then join
    pub async fn run(&self) -> Result<(), WorkerError> {
        self.start().await?;
        self.join().await
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.inner.name)
            .field("activity", &self.inner.activity.name())
            .field("status", &self.status())
            .finish()
    }
}

/// Non-owning worker reference, for hooks that point at sibling workers
#[derive(Clone)]
pub(crate) struct WeakWorker(Weak<WorkerInner>);

impl WeakWorker {
    pub(crate) fn upgrade(&self) -> Option<Worker> {
        self.0.upgrade().map(|inner| Worker { inner })
    }
}

/// Handle to end a worker
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<WorkerInner>,
}

impl StopHandle {
    /// End the worker; see [`Worker::end`]
    pub fn end(&self) {
        self.inner.end();
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("worker", &self.inner.name)
            .finish()
    }
}

impl WorkerInner {
    fn end(&self) {
        if !self.finish.is_cancelled() {
            info!(worker = %self.name, "Ending worker, waiting on final poll");
        }
        self.finish.cancel();
        self.poller.stop();
        self.status.send_if_modified(|status| {
            if matches!(*status, WorkerStatus::Polling | WorkerStatus::Executing) {
                *status = WorkerStatus::Stopping;
                true
            } else {
                false
            }
        });
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.send_if_modified(|current| {
            let allowed = match *current {
                WorkerStatus::Stopped => false,
                WorkerStatus::Stopping => status == WorkerStatus::Stopped,
                _ => true,
            };
            if allowed && *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    async fn run_hooks(&self, hooks: &RwLock<Vec<ExecuteHook>>) {
        let hooks: Vec<ExecuteHook> = hooks.read().clone();
        for hook in hooks {
            hook().await;
        }
    }

    #[instrument(skip_all, fields(worker = %self.name, task_token = %task.task_token))]
    async fn execute(&self, task: ActivityTask) -> Result<TaskOutcome, WorkerError> {
        debug!(input = %task.input, "Got task");
        self.set_status(WorkerStatus::Executing);
        self.hooks_pending.store(true, Ordering::Release);
        self.run_hooks(&self.pre_execute_hooks).await;

        let execution = TaskExecution::new(
            self.activity.clone(),
            task,
            Arc::clone(self.session.service()),
        );
        let result = if self.finish.is_cancelled() {
            execution.report_cancelled().await
        } else {
            *self.current.lock() = Some(execution.interrupt_token());
            let result = execution.run().await;
            self.current.lock().take();
            result
        };

        self.hooks_pending.store(false, Ordering::Release);
        self.run_hooks(&self.post_execute_hooks).await;
        self.set_status(WorkerStatus::Polling);

        let outcome = result?;
        info!(outcome = ?outcome, "Task finished");
        Ok(outcome)
    }

    async fn finish_loop(&self, result: Result<(), WorkerError>) {
        self.set_status(WorkerStatus::Stopping);
        self.finish.cancel();
        self.poller.stop();

        // loop died between the hooks; post-hooks release what pre-hooks took
        if self.hooks_pending.swap(false, Ordering::AcqRel) {
            warn!(worker = %self.name, "Running post-execute hooks after abnormal exit");
            let post = AssertUnwindSafe(self.run_hooks(&self.post_execute_hooks)).catch_unwind();
            if let Err(panic) = post.await {
                let message = panic_message(panic);
                error!(worker = %self.name, error = %message, "Post-execute hook panicked");
            }
        }

        self.poller.stopped().await;

        for task in self.poller.drain().await {
            let execution = TaskExecution::new(
                self.activity.clone(),
                task,
                Arc::clone(self.session.service()),
            );
            if let Err(e) = execution.report_cancelled().await {
                warn!(error = %e, "Failed to cancel undispatched task");
            }
        }

        match &result {
            Ok(()) => info!(worker = %self.name, "Worker stopped"),
            Err(e) => error!(worker = %self.name, error = %e, "Worker failed"),
        }
        *self.result.lock() = Some(result);
        self.set_status(WorkerStatus::Stopped);
    }
}

async fn worker_loop(inner: Arc<WorkerInner>) -> Result<(), WorkerError> {
    loop {
        let polled = tokio::select! {
            biased;
            _ = inner.finish.cancelled() => return Ok(()),
            polled = inner.poller.get(inner.config.poll_wait) => polled,
        };

        match polled {
            Ok(Some(task)) => {
                inner.execute(task).await?;
            }
            Ok(None) => continue,
            Err(PollerError::Stopped) if inner.finish.is_cancelled() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
