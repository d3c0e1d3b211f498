//! Queue service
//!
//! The API the rest of the application uses to schedule and inspect work,
//! addressed by queue name. Enqueue paths require the queue to be registered
//! and fail with [`QueueError::NotRegistered`] otherwise; lookups report a
//! missing queue or job as `None`/`false`/empty instead of an error.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::job::{JobOptions, JobPriority, JobRecord, JobState};
use crate::payload::{JobData, JobPayload};
use crate::persistence::{JobCounts, Pagination, StoreError};
use crate::queue::{BulkJob, QueueError, QueueFactory, QueueHandle};
use crate::registry::QueueRegistry;
use crate::schedule::RepeatOptions;

/// Name-indexed enqueue and inspection API
#[derive(Clone)]
pub struct QueueService {
    registry: Arc<RwLock<QueueRegistry>>,
    factory: Arc<QueueFactory>,
}

impl QueueService {
    pub fn new(registry: Arc<RwLock<QueueRegistry>>, factory: Arc<QueueFactory>) -> Self {
        Self { registry, factory }
    }

    /// Queue handle for a registered queue, created with the definition's
    /// default job options
    async fn registered_queue(&self, queue: &str) -> Result<QueueHandle, QueueError> {
        let registry = self.registry.read().await;
        let definition = registry
            .get(queue)
            .ok_or_else(|| QueueError::NotRegistered(queue.to_string()))?;
        Ok(self
            .factory
            .create_queue_with(queue, &definition.default_job_options))
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Add one job named after its queue
    ///
    /// A `priority` field in `data` is used when `options` leave the priority
    /// unset.
    #[instrument(skip(self, data, options))]
    pub async fn add_job(
        &self,
        queue: &str,
        data: Value,
        options: JobOptions,
    ) -> Result<JobRecord, QueueError> {
        let handle = self.registered_queue(queue).await?;
        let options = with_data_priority(options, &data);
        let job = handle.add(queue, data, options).await?;
        debug!(queue, job_id = %job.id, "enqueued job");
        Ok(job)
    }

    /// Add a typed job to its payload's queue
    pub async fn add<P: JobPayload>(
        &self,
        data: JobData<P>,
        options: JobOptions,
    ) -> Result<JobRecord, QueueError> {
        let value =
            serde_json::to_value(&data).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.add_job(P::QUEUE, value, options).await
    }

    /// Add several jobs in one store operation
    ///
    /// Unnamed jobs are named `{queue}-job-{index}`.
    #[instrument(skip(self, jobs), fields(count = jobs.len()))]
    pub async fn add_bulk_jobs(
        &self,
        queue: &str,
        jobs: Vec<BulkJob>,
    ) -> Result<Vec<JobRecord>, QueueError> {
        let handle = self.registered_queue(queue).await?;
        let jobs = jobs
            .into_iter()
            .map(|job| BulkJob {
                options: with_data_priority(job.options, &job.data),
                ..job
            })
            .collect();
        Ok(handle.add_bulk(jobs).await?)
    }

    /// Schedule a recurring job
    #[instrument(skip(self, data, repeat, options), fields(pattern = %repeat.pattern))]
    pub async fn add_recurring_job(
        &self,
        queue: &str,
        job_name: &str,
        data: Value,
        repeat: RepeatOptions,
        options: JobOptions,
    ) -> Result<JobRecord, QueueError> {
        let handle = self.registered_queue(queue).await?;
        let options = with_data_priority(options, &data);
        handle.add_repeatable(job_name, data, repeat, options).await
    }

    /// Stop a recurring job; returns how many pending occurrences were removed
    pub async fn remove_recurring_job(
        &self,
        queue: &str,
        job_name: &str,
    ) -> Result<usize, StoreError> {
        match self.factory.queue(queue) {
            Some(handle) => handle.remove_repeatable(job_name).await,
            None => Ok(0),
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        match self.factory.queue(queue) {
            Some(handle) => handle.get_job(job_id).await,
            None => Ok(None),
        }
    }

    /// Remove a job; `false` when the queue or job is unknown or the job is
    /// running
    pub async fn remove_job(&self, queue: &str, job_id: &str) -> Result<bool, StoreError> {
        match self.factory.queue(queue) {
            Some(handle) => handle.remove_job(job_id).await,
            None => Ok(false),
        }
    }

    /// Re-queue a failed job with its attempts reset
    pub async fn retry_job(&self, queue: &str, job_id: &str) -> Result<bool, StoreError> {
        match self.factory.queue(queue) {
            Some(handle) => handle.retry_job(job_id).await,
            None => Ok(false),
        }
    }

    /// Jobs in `state`, positions `start..=end`
    pub async fn get_jobs_by_status(
        &self,
        queue: &str,
        state: JobState,
        start: u32,
        end: u32,
    ) -> Result<Vec<JobRecord>, StoreError> {
        match self.factory.queue(queue) {
            Some(handle) => handle.get_jobs(state, Pagination::range(start, end)).await,
            None => Ok(vec![]),
        }
    }

    pub async fn get_queue_metrics(&self, queue: &str) -> Result<Option<JobCounts>, StoreError> {
        self.factory.get_queue_metrics(queue).await
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Stop workers from claiming jobs on `queue`; `false` if the queue is unknown
    pub async fn pause_queue(&self, queue: &str) -> Result<bool, StoreError> {
        match self.factory.queue(queue) {
            Some(handle) => handle.pause().await.map(|()| true),
            None => Ok(false),
        }
    }

    pub async fn resume_queue(&self, queue: &str) -> Result<bool, StoreError> {
        match self.factory.queue(queue) {
            Some(handle) => handle.resume().await.map(|()| true),
            None => Ok(false),
        }
    }
}

/// Fill an unset priority from the job data's `priority` field
///
/// Accepts a level name (`"high"`) or a raw number.
fn with_data_priority(options: JobOptions, data: &Value) -> JobOptions {
    if options.priority.is_some() {
        return options;
    }

    let priority = match data.get("priority") {
        Some(Value::Number(n)) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Some(level @ Value::String(_)) => serde_json::from_value::<JobPriority>(level.clone())
            .ok()
            .map(JobPriority::value),
        _ => None,
    };

    match priority {
        Some(priority) => options.with_priority_value(priority),
        None => options,
    }
}
