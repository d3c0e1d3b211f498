//! Job polling with exponential backoff
//!
//! Claims jobs with adaptive polling intervals: back off while the queue is
//! idle, reset to the minimum interval as soon as jobs show up.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use crate::job::JobRecord;
use crate::persistence::StoreError;
use crate::queue::QueueHandle;
use crate::serde_millis::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when jobs are available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no jobs found
    pub backoff_multiplier: f64,

    /// Maximum jobs to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Job poller with adaptive backoff
pub struct JobPoller {
    queue: QueueHandle,
    worker_id: String,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl JobPoller {
    /// Create a new job poller
    pub fn new(
        queue: QueueHandle,
        worker_id: String,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            worker_id,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Claim up to `max_jobs` jobs
    ///
    /// Returns claimed jobs and updates internal backoff state.
    #[instrument(skip(self), fields(queue = %self.queue.name(), worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_jobs: usize) -> Result<Vec<JobRecord>, StoreError> {
        if *self.shutdown_rx.borrow() {
            debug!("Poller shutdown requested");
            return Ok(vec![]);
        }

        let batch_size = max_jobs.min(self.config.batch_size);
        let jobs = match self.queue.claim(&self.worker_id, batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                // Store trouble: back off like an idle queue
                self.increase_backoff();
                return Err(e);
            }
        };

        if jobs.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "No jobs found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = jobs.len(), "Claimed jobs");
        }

        Ok(jobs)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns early when the store signals new work; returns `true` if
    /// shutdown is signaled.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            result = self.queue.wait_for_job(self.current_interval) => {
                if let Err(e) = result {
                    warn!(queue = %self.queue.name(), error = %e, "wait for job failed");
                    tokio::time::sleep(self.current_interval).await;
                }
                false
            }
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Reset backoff to minimum interval
    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    /// Increase backoff interval
    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}
