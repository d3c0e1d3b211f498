//! Worker for job execution
//!
//! Runs a queue's processor over claimed jobs with bounded concurrency and
//! graceful shutdown.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{JobPoller, PollerConfig};
use crate::job::{JobId, JobRecord};
use crate::persistence::{FailureOutcome, StoreError};
use crate::processor::{panic_message, JobError, JobResult, Processor};
use crate::queue::QueueHandle;
use crate::serde_millis::{duration_millis, option_duration_millis};

const EVENT_CAPACITY: usize = 256;

/// Worker options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerOptions {
    /// Maximum jobs processed at the same time
    pub concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// How long `close` waits for in-flight jobs
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Fail an attempt that runs longer than this (off when unset)
    #[serde(default, with = "option_duration_millis")]
    pub job_timeout: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            job_timeout: None,
        }
    }
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the per-job timeout
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Worker is claiming and processing jobs
    Running,
    /// Worker is draining (finishing current jobs, not claiming new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Job and worker lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A job finished successfully
    Completed {
        queue: String,
        job_id: JobId,
        result: Value,
    },

    /// A job attempt failed
    Failed {
        queue: String,
        job_id: JobId,
        error: String,
        attempts_made: u32,
        will_retry: bool,
    },

    /// Worker-level error, not tied to a job outcome
    Error { queue: String, error: String },
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Concurrency must be at least one
    #[error("invalid concurrency {0}: must be at least 1")]
    InvalidConcurrency(usize),

    /// Workers spawn tasks and need a tokio runtime
    #[error("workers must be started inside a tokio runtime")]
    NoRuntime,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {remaining} jobs still running")]
    ShutdownTimeout { remaining: usize },
}

/// Processes jobs from one queue
///
/// # Example
///
/// ```ignore
/// use atcdrill_jobs::{processor_fn, Worker, WorkerOptions};
///
/// let worker = Worker::start(
///     queue,
///     processor_fn(|job| async move { Ok(json!({ "received": job.data })) }),
///     WorkerOptions::new().with_concurrency(5),
/// )?;
///
/// // ... later, graceful shutdown
/// worker.close().await?;
/// ```
pub struct Worker {
    id: String,
    queue: QueueHandle,
    options: WorkerOptions,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerStatus>,
    slots: Arc<Semaphore>,
    events: broadcast::Sender<WorkerEvent>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Start a worker on `queue`
    pub fn start(
        queue: QueueHandle,
        processor: Processor,
        options: WorkerOptions,
    ) -> Result<Arc<Self>, WorkerError> {
        if options.concurrency == 0 {
            return Err(WorkerError::InvalidConcurrency(options.concurrency));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| WorkerError::NoRuntime)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let worker = Arc::new(Self {
            id: format!("{}-worker-{}", queue.name(), Uuid::now_v7()),
            slots: Arc::new(Semaphore::new(options.concurrency)),
            queue,
            options,
            shutdown_tx,
            status: RwLock::new(WorkerStatus::Running),
            events,
            poll_handle: Mutex::new(None),
        });

        info!(
            queue = worker.queue.name(),
            worker_id = %worker.id,
            concurrency = worker.options.concurrency,
            "Starting worker"
        );

        let handle = runtime.spawn(poll_loop(
            worker.queue.clone(),
            worker.id.clone(),
            processor,
            worker.options.clone(),
            Arc::clone(&worker.slots),
            worker.events.clone(),
            shutdown_rx,
        ));
        *worker.poll_handle.lock() = Some(handle);

        Ok(worker)
    }

    /// Stop claiming jobs and wait for in-flight jobs to finish
    ///
    /// Safe to call more than once. No job is claimed by this worker after the
    /// call returns, even when it times out.
    #[instrument(skip(self), fields(queue = %self.queue.name(), worker_id = %self.id))]
    pub async fn close(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status != WorkerStatus::Running {
                return Ok(());
            }
            *status = WorkerStatus::Draining;
        }

        info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        // The poll loop hands off its last claimed batch before exiting
        let handle = self.poll_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Poll loop ended abnormally");
            }
        }

        let deadline = tokio::time::Instant::now() + self.options.shutdown_timeout;
        loop {
            let running = self.active_jobs();
            if running == 0 {
                debug!("All jobs completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_jobs = running, "Shutdown timeout reached");
                *self.status.write() = WorkerStatus::Stopped;
                return Err(WorkerError::ShutdownTimeout { remaining: running });
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerStatus::Stopped;
        info!("Worker stopped");
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    pub fn concurrency(&self) -> usize {
        self.options.concurrency
    }

    /// Number of jobs currently being processed
    pub fn active_jobs(&self) -> usize {
        self.options.concurrency - self.slots.available_permits()
    }

    /// Subscribe to job and worker events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }
}

async fn poll_loop(
    queue: QueueHandle,
    worker_id: String,
    processor: Processor,
    options: WorkerOptions,
    slots: Arc<Semaphore>,
    events: broadcast::Sender<WorkerEvent>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut poller = JobPoller::new(queue.clone(), worker_id.clone(), options.poller, shutdown_rx);

    loop {
        if poller.is_shutdown() {
            debug!(worker_id = %worker_id, "Poll loop: shutdown requested");
            break;
        }

        let available_slots = slots.available_permits();
        if available_slots == 0 {
            if poller.wait().await {
                break;
            }
            continue;
        }

        match poller.poll(available_slots).await {
            Ok(jobs) => {
                for job in jobs {
                    // Only this loop takes permits, so one is free for every
                    // claimed job
                    let permit = match Arc::clone(&slots).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            error!(worker_id = %worker_id, job_id = %job.id, "Worker slots closed");
                            break;
                        }
                    };

                    tokio::spawn(run_job(
                        queue.clone(),
                        Arc::clone(&processor),
                        job,
                        options.job_timeout,
                        events.clone(),
                        permit,
                    ));
                }
            }
            Err(StoreError::QueueClosed(_)) => {
                debug!(worker_id = %worker_id, "Poll loop: queue closed");
                break;
            }
            Err(e) => {
                error!(queue = queue.name(), worker_id = %worker_id, error = %e, "Poll error");
                let _ = events.send(WorkerEvent::Error {
                    queue: queue.name().to_string(),
                    error: e.to_string(),
                });
            }
        }

        if poller.wait().await {
            break;
        }
    }

    debug!(worker_id = %worker_id, "Poll loop exited");
}

async fn run_job(
    queue: QueueHandle,
    processor: Processor,
    job: JobRecord,
    job_timeout: Option<Duration>,
    events: broadcast::Sender<WorkerEvent>,
    permit: OwnedSemaphorePermit,
) {
    let queue_name = queue.name().to_string();
    let job_id = job.id.clone();

    // The next occurrence is scheduled on claim so a slow or failing
    // occurrence does not stall the schedule
    if job.repeat.is_some() {
        if let Err(e) = queue.schedule_next_repetition(&job).await {
            error!(queue = %queue_name, job_id = %job_id, error = %e, "Failed to schedule next occurrence");
            let _ = events.send(WorkerEvent::Error {
                queue: queue_name.clone(),
                error: e.to_string(),
            });
        }
    }

    debug!(queue = %queue_name, job_id = %job_id, name = %job.name, "Processing job");

    match execute(&processor, job, job_timeout).await {
        Ok(result) => match queue.complete(&job_id, result.clone()).await {
            Ok(()) => {
                info!(queue = %queue_name, job_id = %job_id, "Job completed");
                let _ = events.send(WorkerEvent::Completed {
                    queue: queue_name,
                    job_id,
                    result,
                });
            }
            Err(e) => {
                error!(queue = %queue_name, job_id = %job_id, error = %e, "Failed to record job completion");
                let _ = events.send(WorkerEvent::Error {
                    queue: queue_name,
                    error: e.to_string(),
                });
            }
        },
        Err(job_error) => {
            let message = job_error.to_string();
            match queue.fail(&job_id, &message, job_error.retryable).await {
                Ok(outcome) => {
                    match outcome {
                        FailureOutcome::WillRetry {
                            attempts_made,
                            delay,
                        } => warn!(
                            queue = %queue_name,
                            job_id = %job_id,
                            attempts_made,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %message,
                            "Job failed, will retry"
                        ),
                        FailureOutcome::Failed { attempts_made } => error!(
                            queue = %queue_name,
                            job_id = %job_id,
                            attempts_made,
                            error = %message,
                            "Job failed"
                        ),
                    }
                    let _ = events.send(WorkerEvent::Failed {
                        queue: queue_name,
                        job_id,
                        error: message,
                        attempts_made: outcome.attempts_made(),
                        will_retry: outcome.will_retry(),
                    });
                }
                Err(e) => {
                    error!(queue = %queue_name, job_id = %job_id, error = %e, "Failed to record job failure");
                    let _ = events.send(WorkerEvent::Error {
                        queue: queue_name,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    drop(permit);
}

/// Run the processor, turning panics and timeouts into job errors
async fn execute(processor: &Processor, job: JobRecord, job_timeout: Option<Duration>) -> JobResult {
    let run = AssertUnwindSafe(processor(job)).catch_unwind();

    let outcome = match job_timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(JobError::retryable(format!(
                    "job timed out after {}ms",
                    limit.as_millis()
                ))
                .with_type("TIMEOUT"))
            }
        },
        None => run.await,
    };

    outcome.unwrap_or_else(|panic| {
        Err(
            JobError::retryable(format!("processor panicked: {}", panic_message(&*panic)))
                .with_type("PANIC"),
        )
    })
}
