//! Several workers in one process, executing one task at a time

use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, instrument, warn};

use super::activity_worker::{WeakWorker, Worker, WorkerError};
use crate::activity::Activity;
use crate::config::{Session, WorkerConfig};
use crate::naming::default_worker_name;

/// The execution slot plus the siblings paused for it
///
/// Dropping the lease resumes the siblings' polling, then frees the slot.
struct SlotLease {
    siblings: Vec<Worker>,
    _slot: OwnedMutexGuard<()>,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        for sibling in &self.siblings {
            sibling.allow_poll();
        }
    }
}

/// Runs one worker per activity, with mutually exclusive executions
///
/// Before a worker executes a task it takes the manager's execution slot
/// and pauses every other worker's polling; afterwards it resumes them and
/// releases the slot. A task claimed by a sibling in the meantime waits for
/// the slot.
///
/// # Example
///
/// ```ignore
/// let manager = WorkersManager::new(vec![resize, upload], None, session);
/// manager.run().await?;
/// ```
pub struct WorkersManager {
    name: String,
    session: Session,
    workers: Vec<Worker>,
}

impl WorkersManager {
    /// Create a manager; `name` (shared by all workers) defaults to
    /// `{host}-{8 hex chars}`
    pub fn new(activities: Vec<Activity>, name: Option<String>, session: Session) -> Self {
        Self::with_config(activities, name, session, WorkerConfig::default())
    }

    /// Create a manager with explicit worker tuning
    pub fn with_config(
        activities: Vec<Activity>,
        name: Option<String>,
        session: Session,
        config: WorkerConfig,
    ) -> Self {
        let name = name.unwrap_or_else(default_worker_name);
        let workers: Vec<Worker> = activities
            .into_iter()
            .map(|activity| {
                Worker::with_config(activity, Some(name.clone()), session.clone(), config.clone())
            })
            .collect();

        let slot = Arc::new(tokio::sync::Mutex::new(()));
        let handles: Vec<WeakWorker> = workers.iter().map(Worker::downgrade).collect();

        for (j, worker) in workers.iter().enumerate() {
            let siblings: Arc<Vec<WeakWorker>> = Arc::new(
                handles
                    .iter()
                    .enumerate()
                    .filter(|(k, _)| *k != j)
                    .map(|(_, w)| w.clone())
                    .collect(),
            );
            let held: Arc<Mutex<Option<SlotLease>>> = Arc::new(Mutex::new(None));

            {
                let slot = Arc::clone(&slot);
                let held = Arc::clone(&held);
                worker.add_pre_execute_hook(move || {
                    let slot = Arc::clone(&slot);
                    let siblings = Arc::clone(&siblings);
                    let held = Arc::clone(&held);
                    async move {
                        let lease = SlotLease {
                            siblings: siblings.iter().filter_map(WeakWorker::upgrade).collect(),
                            _slot: slot.lock_owned().await,
                        };
                        debug!(paused = lease.siblings.len(), "Took execution slot");
                        join_all(lease.siblings.iter().map(Worker::cancel_poll)).await;
                        *held.lock() = Some(lease);
                    }
                });
            }
            worker.add_post_execute_hook(move || {
                let held = Arc::clone(&held);
                async move {
                    drop(held.lock().take());
                }
            });
        }

        Self {
            name,
            session,
            workers,
        }
    }

    /// Name shared by all workers
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session shared by all workers
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The workers, in activity order
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Start every worker
    ///
    /// # Errors
    ///
    /// If any worker fails to start, the ones already started are ended and
    /// the error is returned.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        let activities: Vec<&str> = self.workers.iter().map(|w| w.activity().name()).collect();
        info!(activities = ?activities, "Starting workers");

        for worker in &self.workers {
            if let Err(e) = worker.start().await {
                error!(activity = %worker.activity().name(), error = %e, "Worker failed to start");
                self.end();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Wait for all workers, ending them all on Ctrl-C or on the first error
    ///
    /// A second Ctrl-C cancels the task being executed.
    ///
    /// # Errors
    ///
    /// Returns the first worker error.
    pub async fn join(&self) -> Result<(), WorkerError> {
        self.wait_all(true).await
    }

    /// Wait for all workers, ending them all on the first error
    pub async fn wait(&self) -> Result<(), WorkerError> {
        self.wait_all(false).await
    }

    async fn wait_all(&self, mut listen: bool) -> Result<(), WorkerError> {
        let mut waits: FuturesUnordered<_> = self.workers.iter().map(|w| w.wait()).collect();
        let mut first_error = None;
        let mut interrupted = false;

        loop {
            tokio::select! {
                next = waits.next() => match next {
                    None => break,
                    Some(Ok(())) => {}
                    Some(Err(WorkerError::NotStarted)) => {}
                    Some(Err(e)) => {
                        if first_error.is_none() {
                            error!(error = %e, "Worker failed, ending all workers");
                            self.end();
                            first_error = Some(e);
                        }
                    }
                },
                signal = tokio::signal::ctrl_c(), if listen => match signal {
                    Ok(()) if !interrupted => {
                        info!("Interrupt received, finishing");
                        interrupted = true;
                        self.end();
                    }
                    Ok(()) => {
                        warn!("Second interrupt, cancelling execution");
                        for worker in &self.workers {
                            worker.interrupt();
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Cannot listen for interrupts");
                        listen = false;
                    }
                },
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// End every worker; idempotent
    pub fn end(&self) {
        for worker in &self.workers {
            worker.end();
        }
    }

    /// Start, then join
    pub async fn run(&self) -> Result<(), WorkerError> {
        self.start().await?;
        self.join().await
    }
}

impl std::fmt::Debug for WorkersManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkersManager")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .finish()
    }
}
