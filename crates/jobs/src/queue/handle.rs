//! Handle to one named queue

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use super::{QueueDefaults, QueueError};
use crate::job::{JobOptions, JobRecord, JobState, NewJob};
use crate::persistence::{
    FailureOutcome, JobCounts, JobStore, Pagination, RetentionPolicy, StoreError,
};
use crate::schedule::{RepeatOptions, RepeatState, ScheduleError};

/// One entry of a bulk enqueue
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkJob {
    /// Job name; `{queue}-job-{index}` when unset
    pub name: Option<String>,
    pub data: Value,
    pub options: JobOptions,
}

impl BulkJob {
    pub fn new(data: Value) -> Self {
        Self {
            name: None,
            data,
            options: JobOptions::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

struct QueueInner {
    name: String,
    store: Arc<dyn JobStore>,
    defaults: QueueDefaults,
    /// Queue-level default job options, applied before `defaults`
    job_options: JobOptions,
    closed: AtomicBool,
}

/// Handle to one named queue
///
/// Cheap to clone; clones share the same underlying queue. Closing a handle
/// stops enqueues and claims through it, while bookkeeping for jobs that are
/// already running still goes through.
#[derive(Clone)]
pub struct QueueHandle {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl QueueHandle {
    pub(crate) fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        defaults: QueueDefaults,
        job_options: JobOptions,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                store,
                defaults,
                job_options,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting enqueues and claims; returns false if already closed
    pub fn close(&self) -> bool {
        let was_open = !self.inner.closed.swap(true, Ordering::AcqRel);
        if was_open {
            debug!(queue = %self.inner.name, "queue closed");
        }
        was_open
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.inner.defaults.retention
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::QueueClosed(self.inner.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Resolve per-job options against queue and factory defaults
    fn resolve(&self, name: String, data: Value, options: JobOptions) -> NewJob {
        let options = options.or_defaults(&self.inner.job_options);
        NewJob {
            job_id: options.job_id,
            name,
            data,
            priority: options.priority.unwrap_or(0),
            delay: options.delay.unwrap_or(Duration::ZERO),
            attempts: options
                .attempts
                .unwrap_or(self.inner.defaults.attempts)
                .max(1),
            backoff: options
                .backoff
                .unwrap_or_else(|| self.inner.defaults.backoff.clone()),
            repeat: None,
        }
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Add one job
    pub async fn add(
        &self,
        name: impl Into<String>,
        data: Value,
        options: JobOptions,
    ) -> Result<JobRecord, StoreError> {
        self.ensure_open()?;
        let job = self.resolve(name.into(), data, options);
        self.inner.store.add_job(&self.inner.name, job).await
    }

    /// Add several jobs in one store operation
    pub async fn add_bulk(&self, jobs: Vec<BulkJob>) -> Result<Vec<JobRecord>, StoreError> {
        self.ensure_open()?;
        let jobs = jobs
            .into_iter()
            .enumerate()
            .map(|(index, job)| {
                let name = job
                    .name
                    .unwrap_or_else(|| format!("{}-job-{}", self.inner.name, index));
                self.resolve(name, job.data, job.options)
            })
            .collect();
        self.inner.store.add_bulk(&self.inner.name, jobs).await
    }

    /// Schedule a recurring job
    ///
    /// Only the next occurrence is stored; each claimed occurrence enqueues
    /// the one after it. The occurrence id is derived from `name`, so a caller
    /// supplied `job_id` is ignored.
    pub async fn add_repeatable(
        &self,
        name: impl Into<String>,
        data: Value,
        repeat: RepeatOptions,
        options: JobOptions,
    ) -> Result<JobRecord, QueueError> {
        self.ensure_open()?;
        repeat.validate()?;

        let name = name.into();
        let now = Utc::now();
        let state = RepeatState::first(name.clone(), repeat, now)?
            .ok_or_else(|| ScheduleError::Exhausted(name.clone()))?;

        let mut job = self.resolve(name, data, options);
        job.job_id = Some(state.job_id());
        job.delay = (state.scheduled_for - now).to_std().unwrap_or(Duration::ZERO);
        job.repeat = Some(state);

        let record = self.inner.store.add_job(&self.inner.name, job).await?;
        info!(
            queue = %self.inner.name,
            job_id = %record.id,
            scheduled_for = %record.available_at,
            "scheduled recurring job"
        );
        Ok(record)
    }

    /// Enqueue the occurrence following `job`, if it is recurring and its
    /// schedule continues
    pub async fn schedule_next_repetition(
        &self,
        job: &JobRecord,
    ) -> Result<Option<JobRecord>, QueueError> {
        let Some(next) = job.repeat.as_ref().map(RepeatState::next).transpose()?.flatten() else {
            return Ok(None);
        };

        let delay = (next.scheduled_for - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let new_job = NewJob {
            job_id: Some(next.job_id()),
            name: job.name.clone(),
            data: job.data.clone(),
            priority: job.priority,
            delay,
            attempts: job.attempts,
            backoff: job.backoff.clone(),
            repeat: Some(next),
        };

        let record = self.inner.store.add_job(&self.inner.name, new_job).await?;
        debug!(queue = %self.inner.name, job_id = %record.id, "scheduled next occurrence");
        Ok(Some(record))
    }

    /// Remove the pending occurrences of a recurring job; returns how many
    /// were removed
    pub async fn remove_repeatable(&self, name: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for state in [JobState::Delayed, JobState::Waiting] {
            let jobs = self
                .inner
                .store
                .list_jobs(&self.inner.name, state, Pagination::range(0, u32::MAX - 1))
                .await?;

            for job in jobs {
                let matches = job.repeat.as_ref().is_some_and(|r| r.key == name);
                if matches && self.inner.store.remove_job(&self.inner.name, &job.id).await? {
                    removed += 1;
                }
            }
        }

        debug!(queue = %self.inner.name, name, removed, "removed recurring job");
        Ok(removed)
    }

    // =========================================================================
    // Processing
    // =========================================================================

    pub(crate) async fn claim(
        &self,
        worker_id: &str,
        max_jobs: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.ensure_open()?;
        self.inner
            .store
            .claim_jobs(&self.inner.name, worker_id, max_jobs)
            .await
    }

    pub(crate) async fn complete(&self, job_id: &str, result: Value) -> Result<(), StoreError> {
        self.inner
            .store
            .complete_job(&self.inner.name, job_id, result, self.retention())
            .await
    }

    pub(crate) async fn fail(
        &self,
        job_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome, StoreError> {
        self.inner
            .store
            .fail_job(&self.inner.name, job_id, error, retryable, self.retention())
            .await
    }

    pub(crate) async fn wait_for_job(&self, timeout: Duration) -> Result<(), StoreError> {
        self.inner.store.wait_for_job(&self.inner.name, timeout).await
    }

    // =========================================================================
    // Inspection and administration
    // =========================================================================

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.inner.store.get_job(&self.inner.name, job_id).await
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<bool, StoreError> {
        self.inner.store.remove_job(&self.inner.name, job_id).await
    }

    pub async fn retry_job(&self, job_id: &str) -> Result<bool, StoreError> {
        self.inner.store.retry_job(&self.inner.name, job_id).await
    }

    pub async fn get_jobs(
        &self,
        state: JobState,
        pagination: Pagination,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.inner
            .store
            .list_jobs(&self.inner.name, state, pagination)
            .await
    }

    pub async fn counts(&self) -> Result<JobCounts, StoreError> {
        self.inner.store.job_counts(&self.inner.name).await
    }

    pub async fn pause(&self) -> Result<(), StoreError> {
        self.inner.store.pause_queue(&self.inner.name).await?;
        info!(queue = %self.inner.name, "queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), StoreError> {
        self.inner.store.resume_queue(&self.inner.name).await?;
        info!(queue = %self.inner.name, "queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool, StoreError> {
        self.inner.store.is_paused(&self.inner.name).await
    }
}
