//! Activity task polling
//!
//! One long-poll request at a time, issued from a background task and gated
//! on pause depth, stop, and whether the consumer is ready for a task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace};

use crate::naming::{validate_name, NameError};
use crate::service::{ActivityTask, ServiceError, StepFunctions};

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Service error while claiming a task
    #[error("poll failed: {0}")]
    Service(#[from] ServiceError),

    /// Worker name rejected by the service's naming rules
    #[error("invalid worker name: {0}")]
    InvalidName(#[from] NameError),

    /// The poll loop is already running (or ran)
    #[error("poller already started")]
    AlreadyStarted,

    /// The poll loop has stopped and no results remain
    #[error("poller stopped")]
    Stopped,
}

type PollResult = Result<ActivityTask, PollerError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Gate {
    pause_depth: usize,
    wanted: bool,
    stopped: bool,
    in_flight: bool,
    running: bool,
}

impl Gate {
    fn open(&self) -> bool {
        !self.stopped && self.pause_depth == 0 && self.wanted
    }
}

/// Long-polling task claimer for one activity
///
/// After delivering a task the poller does not claim another until the
/// consumer asks for the next one through [`get`](Self::get), so tasks of
/// one worker are executed strictly one after another.
///
/// # Example
///
/// ```ignore
/// let poller = TaskPoller::new(service, "my-host-1a2b3c4d");
/// poller.start(activity_arn)?;
///
/// while let Some(task) = poller.get(Duration::from_secs(5)).await? {
///     // execute task
/// }
///
/// poller.stop();
/// ```
pub struct TaskPoller {
    service: Arc<dyn StepFunctions>,
    worker_name: String,
    gate: Arc<watch::Sender<Gate>>,
    results_tx: Mutex<Option<mpsc::Sender<PollResult>>>,
    results: tokio::sync::Mutex<mpsc::Receiver<PollResult>>,
    activity_arn: Mutex<Option<String>>,
}

impl TaskPoller {
    /// Create a new poller; nothing is polled until [`start`](Self::start)
    pub fn new(service: Arc<dyn StepFunctions>, worker_name: impl Into<String>) -> Self {
        let (gate, _) = watch::channel(Gate::default());
        let (results_tx, results_rx) = mpsc::channel(1);
        Self {
            service,
            worker_name: worker_name.into(),
            gate: Arc::new(gate),
            results_tx: Mutex::new(Some(results_tx)),
            results: tokio::sync::Mutex::new(results_rx),
            activity_arn: Mutex::new(None),
        }
    }

    /// Worker name sent with each claim request
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// ARN of the polled activity, once started
    pub fn activity_arn(&self) -> Option<String> {
        self.activity_arn.lock().clone()
    }

    /// Start polling for tasks of an activity
    ///
    /// # Errors
    ///
    /// Fails without spawning anything if the worker name is invalid or the
    /// poller was already started.
    #[instrument(skip(self), fields(worker = %self.worker_name))]
    pub fn start(&self, activity_arn: impl Into<String> + std::fmt::Debug) -> Result<(), PollerError> {
        validate_name(&self.worker_name)?;
        let results_tx = self
            .results_tx
            .lock()
            .take()
            .ok_or(PollerError::AlreadyStarted)?;

        let activity_arn = activity_arn.into();
        *self.activity_arn.lock() = Some(activity_arn.clone());
        self.gate.send_modify(|g| g.running = true);

        debug!(activity_arn = %activity_arn, "Starting poll loop");
        tokio::spawn(poll_loop(
            Arc::clone(&self.service),
            activity_arn,
            self.worker_name.clone(),
            Arc::clone(&self.gate),
            results_tx,
        ));
        Ok(())
    }

    /// Wait up to `timeout` for the next task
    ///
    /// Returns `Ok(None)` if no task arrived in time (the poller keeps
    /// polling in the background) or the poller stayed paused throughout.
    /// A fatal poll error is returned once; afterwards, and after the loop
    /// has stopped, [`PollerError::Stopped`] is returned.
    ///
    /// Not meant to be called concurrently; concurrent calls are serialized.
    pub async fn get(&self, timeout: Duration) -> Result<Option<ActivityTask>, PollerError> {
        let deadline = Instant::now() + timeout;
        let mut results = self.results.lock().await;

        if !self.gate.borrow().stopped {
            let mut gate = self.gate.subscribe();
            let unpaused = gate.wait_for(|g| g.pause_depth == 0 || g.stopped);
            if tokio::time::timeout_at(deadline, unpaused).await.is_err() {
                return Ok(None);
            }
        }

        match results.try_recv() {
            Ok(result) => return result.map(Some),
            Err(mpsc::error::TryRecvError::Disconnected) => return Err(PollerError::Stopped),
            Err(mpsc::error::TryRecvError::Empty) => {}
        }

        self.gate.send_if_modified(|g| {
            let changed = !g.wanted;
            g.wanted = true;
            changed
        });

        match tokio::time::timeout_at(deadline, results.recv()).await {
            Ok(Some(result)) => result.map(Some),
            Ok(None) => Err(PollerError::Stopped),
            Err(_) => Ok(None),
        }
    }

    /// Stop issuing claim requests and abort the one in flight
    ///
    /// Pauses nest: each call must be matched by [`unpause`](Self::unpause).
    pub fn pause(&self) {
        self.gate.send_modify(|g| g.pause_depth += 1);
        trace!(worker = %self.worker_name, "Polling paused");
    }

    /// Undo one [`pause`](Self::pause)
    pub fn unpause(&self) {
        self.gate
            .send_modify(|g| g.pause_depth = g.pause_depth.saturating_sub(1));
        trace!(worker = %self.worker_name, "Polling unpaused");
    }

    /// Whether polling is paused
    pub fn is_paused(&self) -> bool {
        self.gate.borrow().pause_depth > 0
    }

    /// Wait until no claim request is in flight
    pub async fn quiesced(&self) {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|g| !g.in_flight).await;
    }

    /// Whether a claim request is in flight
    pub fn is_polling(&self) -> bool {
        self.gate.borrow().in_flight
    }

    /// Stop polling permanently; idempotent
    pub fn stop(&self) {
        let stopped = self.gate.send_if_modified(|g| {
            let changed = !g.stopped;
            g.stopped = true;
            changed
        });
        if stopped {
            debug!(worker = %self.worker_name, "Poller stop requested");
        }
        // never started: no loop will drop the sender
        self.results_tx.lock().take();
    }

    /// Whether [`stop`](Self::stop) was called
    pub fn is_stopped(&self) -> bool {
        self.gate.borrow().stopped
    }

    /// Wait until the poll loop has exited
    pub async fn stopped(&self) {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|g| !g.running).await;
    }

    /// Take every task already claimed but not yet handed out
    pub async fn drain(&self) -> Vec<ActivityTask> {
        let mut results = self.results.lock().await;
        let mut tasks = Vec::new();
        while let Ok(result) = results.try_recv() {
            if let Ok(task) = result {
                tasks.push(task);
            }
        }
        tasks
    }
}

impl Drop for TaskPoller {
    fn drop(&mut self) {
        self.gate.send_modify(|g| g.stopped = true);
    }
}

impl std::fmt::Debug for TaskPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPoller")
            .field("worker_name", &self.worker_name)
            .field("activity_arn", &self.activity_arn())
            .field("gate", &*self.gate.borrow())
            .finish()
    }
}

/// Marks the loop as exited however the task ends
struct RunningGuard(Arc<watch::Sender<Gate>>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.send_modify(|g| {
            g.running = false;
            g.in_flight = false;
        });
    }
}

async fn poll_loop(
    service: Arc<dyn StepFunctions>,
    activity_arn: String,
    worker_name: String,
    gate: Arc<watch::Sender<Gate>>,
    results: mpsc::Sender<PollResult>,
) {
    let _running = RunningGuard(Arc::clone(&gate));
    let mut rx = gate.subscribe();

    loop {
        if rx.wait_for(|g| g.stopped || g.open()).await.is_err() {
            break;
        }

        let mut stopped = false;
        let begun = gate.send_if_modified(|g| {
            if g.stopped {
                stopped = true;
                false
            } else if g.open() {
                g.in_flight = true;
                true
            } else {
                false
            }
        });
        if stopped {
            break;
        }
        if !begun {
            continue;
        }

        trace!(activity_arn = %activity_arn, "Polling for task");
        let polled = tokio::select! {
            biased;
            _ = rx.wait_for(|g| !g.open()) => None,
            result = service.get_activity_task(&activity_arn, &worker_name) => Some(result),
        };

        let claimed = matches!(polled, Some(Ok(Some(_))));
        gate.send_modify(|g| {
            g.in_flight = false;
            if claimed {
                g.wanted = false;
            }
        });

        match polled {
            None => debug!("Poll aborted"),
            Some(Ok(None)) => trace!("No task available"),
            Some(Ok(Some(task))) => {
                info!(task_token = %task.task_token, "Claimed task");
                if results.send(Ok(task)).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) if e.is_timeout() => debug!("Poll timed out"),
            Some(Err(e)) => {
                error!(error = %e, "Polling failed");
                let _ = results.send(Err(PollerError::Service(e))).await;
                break;
            }
        }
    }

    debug!(worker = %worker_name, "Poll loop exited");
}
