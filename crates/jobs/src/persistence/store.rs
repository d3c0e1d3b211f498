//! JobStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::retention::RetentionPolicy;
use crate::job::{JobId, JobRecord, JobState, NewJob};
use crate::reliability::BackoffSpec;

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Job not found
    #[error("job {job_id} not found in queue {queue}")]
    JobNotFound { queue: String, job_id: JobId },

    /// Queue handle was closed
    #[error("queue {0} is closed")]
    QueueClosed(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Outcome of failing a job attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Job was re-queued and will run again after `delay`
    WillRetry { attempts_made: u32, delay: Duration },

    /// No attempts remain (or the error was not retryable)
    Failed { attempts_made: u32 },
}

impl FailureOutcome {
    pub fn attempts_made(&self) -> u32 {
        match self {
            Self::WillRetry { attempts_made, .. } | Self::Failed { attempts_made } => {
                *attempts_made
            }
        }
    }

    pub fn will_retry(&self) -> bool {
        matches!(self, Self::WillRetry { .. })
    }
}

/// Decide what happens to a job after a failed attempt
///
/// `attempts_made` already includes the attempt that just failed.
pub(crate) fn failure_outcome(
    attempts_made: u32,
    attempts: u32,
    backoff: &BackoffSpec,
    retryable: bool,
) -> FailureOutcome {
    if retryable && attempts_made < attempts {
        FailureOutcome::WillRetry {
            attempts_made,
            delay: backoff.delay_for_attempt(attempts_made),
        }
    } else {
        FailureOutcome::Failed { attempts_made }
    }
}

/// Job counts per state for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    /// Waiting jobs held back because the queue is paused
    pub paused: u64,
}

/// Pagination parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

impl Pagination {
    /// Inclusive index range `start..=end`
    pub fn range(start: u32, end: u32) -> Self {
        Self {
            offset: start,
            limit: end.saturating_sub(start).saturating_add(1),
        }
    }
}

/// Store for queued, active and finished jobs
///
/// Implementations must be thread-safe and support concurrent access. Claiming
/// is the store's responsibility: a job is handed to at most one worker at a
/// time, even across processes.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Add one job
    ///
    /// If `job.job_id` names an existing job, that job is returned unchanged.
    async fn add_job(&self, queue: &str, job: NewJob) -> Result<JobRecord, StoreError>;

    /// Add several jobs; readers see all of them or none
    async fn add_bulk(&self, queue: &str, jobs: Vec<NewJob>)
        -> Result<Vec<JobRecord>, StoreError>;

    // =========================================================================
    // Processing
    // =========================================================================

    /// Claim up to `max_jobs` due jobs, lowest priority value first, then
    /// insertion order, and mark them active
    async fn claim_jobs(
        &self,
        queue: &str,
        worker_id: &str,
        max_jobs: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Mark an active job completed
    async fn complete_job(
        &self,
        queue: &str,
        job_id: &str,
        result: serde_json::Value,
        retention: &RetentionPolicy,
    ) -> Result<(), StoreError>;

    /// Record a failed attempt; re-queues the job if attempts remain
    async fn fail_job(
        &self,
        queue: &str,
        job_id: &str,
        error: &str,
        retryable: bool,
        retention: &RetentionPolicy,
    ) -> Result<FailureOutcome, StoreError>;

    /// Wait until a job may be available or `timeout` elapses
    ///
    /// Backends with change notifications can wake workers early.
    async fn wait_for_job(&self, _queue: &str, timeout: Duration) -> Result<(), StoreError> {
        tokio::time::sleep(timeout).await;
        Ok(())
    }

    // =========================================================================
    // Inspection and administration
    // =========================================================================

    async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Remove a job that is not active; returns whether a job was removed
    async fn remove_job(&self, queue: &str, job_id: &str) -> Result<bool, StoreError>;

    /// Move a failed job back to waiting with its attempts reset; returns
    /// whether the job was retried
    async fn retry_job(&self, queue: &str, job_id: &str) -> Result<bool, StoreError>;

    /// List jobs in one state, in the order they are served or finished
    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        pagination: Pagination,
    ) -> Result<Vec<JobRecord>, StoreError>;

    async fn job_counts(&self, queue: &str) -> Result<JobCounts, StoreError>;

    async fn pause_queue(&self, queue: &str) -> Result<(), StoreError>;

    async fn resume_queue(&self, queue: &str) -> Result<(), StoreError>;

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError>;

    /// Check connectivity
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_outcome_retries_until_attempts_exhausted() {
        let backoff = BackoffSpec::exponential(Duration::from_secs(2));

        assert_eq!(
            failure_outcome(1, 3, &backoff, true),
            FailureOutcome::WillRetry {
                attempts_made: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            failure_outcome(2, 3, &backoff, true),
            FailureOutcome::WillRetry {
                attempts_made: 2,
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(
            failure_outcome(3, 3, &backoff, true),
            FailureOutcome::Failed { attempts_made: 3 }
        );
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let outcome = failure_outcome(1, 5, &BackoffSpec::default(), false);
        assert_eq!(outcome, FailureOutcome::Failed { attempts_made: 1 });
        assert!(!outcome.will_retry());
    }

    #[test]
    fn test_pagination_range_is_inclusive() {
        let page = Pagination::range(0, 9);
        assert_eq!(page.offset, 0);
        assert_eq!(page.limit, 10);

        let page = Pagination::range(5, 5);
        assert_eq!(page.limit, 1);
    }
}
