//! In-memory implementation of JobStore for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::debug;

use super::retention::{KeepJobs, RetentionPolicy};
use super::store::*;
use super::due_at;
use crate::job::{JobId, JobRecord, JobState, NewJob};

/// Internal job state
struct StoredJob {
    record: JobRecord,
    /// Insertion order, used to break priority ties
    seq: u64,
}

/// Internal queue state
#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, StoredJob>,
    paused: bool,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, queue: &str, job: NewJob, now: DateTime<Utc>) -> JobRecord {
        if let Some(existing) = job.job_id.as_ref().and_then(|id| self.jobs.get(id)) {
            return existing.record.clone();
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let id = match job.job_id {
            Some(ref id) => id.clone(),
            None => {
                // Skip numbers taken by caller-supplied ids
                let mut candidate = seq;
                while self.jobs.contains_key(&candidate.to_string()) {
                    self.next_seq += 1;
                    candidate = self.next_seq;
                }
                candidate.to_string()
            }
        };

        let record = JobRecord {
            id: id.clone(),
            queue_name: queue.to_string(),
            state: job.initial_state(),
            available_at: due_at(now, job.delay),
            name: job.name,
            data: job.data,
            priority: job.priority,
            attempts: job.attempts,
            backoff: job.backoff,
            attempts_made: 0,
            result: None,
            failed_reason: None,
            error_history: vec![],
            repeat: job.repeat,
            created_at: now,
            processed_at: None,
            finished_at: None,
        };

        self.jobs.insert(
            id,
            StoredJob {
                record: record.clone(),
                seq,
            },
        );
        record
    }

    /// Move delayed jobs whose time has come to waiting
    fn promote_due(&mut self, now: DateTime<Utc>) {
        for job in self.jobs.values_mut() {
            if job.record.state == JobState::Delayed && job.record.available_at <= now {
                job.record.state = JobState::Waiting;
            }
        }
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .values()
            .filter(|j| j.record.state == JobState::Delayed)
            .map(|j| j.record.available_at)
            .min()
    }

    /// Jobs in one state, in the order they are served or finished
    fn sorted(&self, state: JobState) -> Vec<&StoredJob> {
        let mut jobs: Vec<&StoredJob> = self
            .jobs
            .values()
            .filter(|j| j.record.state == state)
            .collect();

        match state {
            JobState::Waiting => jobs.sort_by_key(|j| (j.record.priority, j.seq)),
            JobState::Delayed => jobs.sort_by_key(|j| (j.record.available_at, j.seq)),
            JobState::Active => jobs.sort_by_key(|j| (j.record.processed_at, j.seq)),
            // Most recently finished first
            JobState::Completed | JobState::Failed => jobs.sort_by(|a, b| {
                b.record
                    .finished_at
                    .cmp(&a.record.finished_at)
                    .then(b.seq.cmp(&a.seq))
            }),
        }
        jobs
    }

    /// Apply retention to finished jobs in `state`
    fn prune(&mut self, state: JobState, keep: &KeepJobs, now: DateTime<Utc>) {
        let cutoff = keep.cutoff(now);
        let mut doomed: Vec<JobId> = Vec::new();

        for (index, job) in self.sorted(state).into_iter().enumerate() {
            let too_old = match (cutoff, job.record.finished_at) {
                (Some(cutoff), Some(finished_at)) => finished_at < cutoff,
                _ => false,
            };
            let over_count = keep.count.is_some_and(|count| index >= count);
            if too_old || over_count {
                doomed.push(job.record.id.clone());
            }
        }

        for id in doomed {
            self.jobs.remove(&id);
        }
    }
}

/// In-memory implementation of JobStore
///
/// This is primarily for testing and single-process deployments. It keeps all
/// jobs in memory and provides the same semantics as the PostgreSQL
/// implementation.
///
/// # Example
///
/// ```
/// use atcdrill_jobs::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// ```
pub struct InMemoryJobStore {
    queues: RwLock<HashMap<String, QueueState>>,
    /// Woken whenever a job may have become claimable
    job_added: Notify,
}

impl InMemoryJobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            job_added: Notify::new(),
        }
    }

    /// Get the number of jobs held for a queue, in any state
    pub fn job_count(&self, queue: &str) -> usize {
        self.queues
            .read()
            .get(queue)
            .map(|q| q.jobs.len())
            .unwrap_or(0)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.queues.write().clear();
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn add_job(&self, queue: &str, job: NewJob) -> Result<JobRecord, StoreError> {
        let record = {
            let mut queues = self.queues.write();
            queues
                .entry(queue.to_string())
                .or_default()
                .insert(queue, job, Utc::now())
        };

        debug!(queue, job_id = %record.id, "added job");
        self.job_added.notify_waiters();
        Ok(record)
    }

    async fn add_bulk(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let records: Vec<JobRecord> = {
            let mut queues = self.queues.write();
            let state = queues.entry(queue.to_string()).or_default();
            let now = Utc::now();
            jobs.into_iter()
                .map(|job| state.insert(queue, job, now))
                .collect()
        };

        debug!(queue, count = records.len(), "added jobs in bulk");
        self.job_added.notify_waiters();
        Ok(records)
    }

    async fn claim_jobs(
        &self,
        queue: &str,
        worker_id: &str,
        max_jobs: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        if max_jobs == 0 {
            return Ok(vec![]);
        }

        let mut queues = self.queues.write();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(vec![]);
        };
        if state.paused {
            return Ok(vec![]);
        }

        let now = Utc::now();
        state.promote_due(now);

        let ids: Vec<JobId> = state
            .sorted(JobState::Waiting)
            .into_iter()
            .take(max_jobs)
            .map(|j| j.record.id.clone())
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.record.state = JobState::Active;
                job.record.processed_at = Some(now);
                claimed.push(job.record.clone());
            }
        }

        if !claimed.is_empty() {
            debug!(queue, worker_id, count = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    async fn complete_job(
        &self,
        queue: &str,
        job_id: &str,
        result: serde_json::Value,
        retention: &RetentionPolicy,
    ) -> Result<(), StoreError> {
        let mut queues = self.queues.write();
        let state = queues.get_mut(queue).ok_or_else(|| not_found(queue, job_id))?;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| not_found(queue, job_id))?;

        let now = Utc::now();
        job.record.state = JobState::Completed;
        job.record.result = Some(result);
        job.record.finished_at = Some(now);

        state.prune(JobState::Completed, &retention.completed, now);
        Ok(())
    }

    async fn fail_job(
        &self,
        queue: &str,
        job_id: &str,
        error: &str,
        retryable: bool,
        retention: &RetentionPolicy,
    ) -> Result<FailureOutcome, StoreError> {
        let outcome = {
            let mut queues = self.queues.write();
            let state = queues.get_mut(queue).ok_or_else(|| not_found(queue, job_id))?;
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| not_found(queue, job_id))?;

            let now = Utc::now();
            let record = &mut job.record;
            record.attempts_made += 1;
            record.failed_reason = Some(error.to_string());
            record.error_history.push(error.to_string());

            let outcome = failure_outcome(
                record.attempts_made,
                record.attempts,
                &record.backoff,
                retryable,
            );

            match outcome {
                FailureOutcome::WillRetry { delay, .. } => {
                    record.state = if delay.is_zero() {
                        JobState::Waiting
                    } else {
                        JobState::Delayed
                    };
                    record.available_at = due_at(now, delay);
                }
                FailureOutcome::Failed { .. } => {
                    record.state = JobState::Failed;
                    record.finished_at = Some(now);
                    state.prune(JobState::Failed, &retention.failed, now);
                }
            }
            outcome
        };

        if outcome.will_retry() {
            self.job_added.notify_waiters();
        }
        Ok(outcome)
    }

    async fn wait_for_job(&self, queue: &str, timeout: Duration) -> Result<(), StoreError> {
        let notified = self.job_added.notified();

        // Wake up in time for the next delayed job
        let next_due = self.queues.read().get(queue).and_then(|q| q.next_due());
        let wait = match next_due {
            Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(timeout),
            None => timeout,
        };

        let _ = tokio::time::timeout(wait, notified).await;
        Ok(())
    }

    async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let mut queues = self.queues.write();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        state.promote_due(Utc::now());
        Ok(state.jobs.get(job_id).map(|j| j.record.clone()))
    }

    async fn remove_job(&self, queue: &str, job_id: &str) -> Result<bool, StoreError> {
        let mut queues = self.queues.write();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };

        match state.jobs.get(job_id) {
            Some(job) if job.record.state == JobState::Active => Ok(false),
            Some(_) => {
                state.jobs.remove(job_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn retry_job(&self, queue: &str, job_id: &str) -> Result<bool, StoreError> {
        let retried = {
            let mut queues = self.queues.write();
            let job = queues
                .get_mut(queue)
                .and_then(|state| state.jobs.get_mut(job_id));

            match job {
                Some(job) if job.record.state == JobState::Failed => {
                    let record = &mut job.record;
                    record.state = JobState::Waiting;
                    record.attempts_made = 0;
                    record.failed_reason = None;
                    record.finished_at = None;
                    record.processed_at = None;
                    record.available_at = Utc::now();
                    true
                }
                _ => false,
            }
        };

        if retried {
            self.job_added.notify_waiters();
        }
        Ok(retried)
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        pagination: Pagination,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut queues = self.queues.write();
        let Some(queue_state) = queues.get_mut(queue) else {
            return Ok(vec![]);
        };
        queue_state.promote_due(Utc::now());

        Ok(queue_state
            .sorted(state)
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .map(|j| j.record.clone())
            .collect())
    }

    async fn job_counts(&self, queue: &str) -> Result<JobCounts, StoreError> {
        let mut queues = self.queues.write();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(JobCounts::default());
        };
        state.promote_due(Utc::now());

        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            match job.record.state {
                JobState::Waiting if state.paused => counts.paused += 1,
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Delayed => counts.delayed += 1,
            }
        }
        Ok(counts)
    }

    async fn pause_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.queues
            .write()
            .entry(queue.to_string())
            .or_default()
            .paused = true;
        Ok(())
    }

    async fn resume_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.queues
            .write()
            .entry(queue.to_string())
            .or_default()
            .paused = false;
        self.job_added.notify_waiters();
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError> {
        Ok(self
            .queues
            .read()
            .get(queue)
            .map(|q| q.paused)
            .unwrap_or(false))
    }
}

fn not_found(queue: &str, job_id: &str) -> StoreError {
    StoreError::JobNotFound {
        queue: queue.to_string(),
        job_id: job_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPriority;
    use crate::reliability::BackoffSpec;
    use serde_json::json;

    fn new_job(name: &str) -> NewJob {
        NewJob {
            job_id: None,
            name: name.to_string(),
            data: json!({ "name": name }),
            priority: JobPriority::Normal.value(),
            delay: Duration::ZERO,
            attempts: 3,
            backoff: BackoffSpec::exponential(Duration::from_millis(10)),
            repeat: None,
        }
    }

    #[tokio::test]
    async fn test_add_and_get_job() {
        let store = InMemoryJobStore::new();

        let record = store.add_job("email", new_job("welcome")).await.unwrap();
        assert_eq!(record.id, "1");
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.queue_name, "email");

        let fetched = store.get_job("email", "1").await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(store.get_job("email", "2").await.unwrap().is_none());
        assert!(store.get_job("other", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_caller_job_id_is_idempotent() {
        let store = InMemoryJobStore::new();

        let mut job = new_job("first");
        job.job_id = Some("order-42".to_string());
        let first = store.add_job("q", job).await.unwrap();

        let mut again = new_job("second");
        again.job_id = Some("order-42".to_string());
        let second = store.add_job("q", again).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.name, "first");
        assert_eq!(store.job_count("q"), 1);
    }

    #[tokio::test]
    async fn test_generated_ids_skip_caller_ids() {
        let store = InMemoryJobStore::new();

        let mut job = new_job("explicit");
        job.job_id = Some("2".to_string());
        store.add_job("q", job).await.unwrap();

        let a = store.add_job("q", new_job("a")).await.unwrap();
        let b = store.add_job("q", new_job("b")).await.unwrap();
        assert_ne!(a.id, "2");
        assert_ne!(b.id, "2");
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_insertion() {
        let store = InMemoryJobStore::new();

        let mut low = new_job("low");
        low.priority = JobPriority::Low.value();
        store.add_job("q", low).await.unwrap();
        store.add_job("q", new_job("normal-1")).await.unwrap();
        let mut critical = new_job("critical");
        critical.priority = JobPriority::Critical.value();
        store.add_job("q", critical).await.unwrap();
        store.add_job("q", new_job("normal-2")).await.unwrap();

        let claimed = store.claim_jobs("q", "w1", 10).await.unwrap();
        let names: Vec<&str> = claimed.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["critical", "normal-1", "normal-2", "low"]);
        assert!(claimed.iter().all(|j| j.state == JobState::Active));

        // Nothing left to claim
        assert!(store.claim_jobs("q", "w2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_max_jobs() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store.add_job("q", new_job(&format!("job-{}", i))).await.unwrap();
        }

        assert_eq!(store.claim_jobs("q", "w", 2).await.unwrap().len(), 2);
        assert_eq!(store.claim_jobs("q", "w", 0).await.unwrap().len(), 0);
        assert_eq!(store.claim_jobs("q", "w", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delayed_job_becomes_claimable() {
        let store = InMemoryJobStore::new();

        let mut job = new_job("later");
        job.delay = Duration::from_millis(50);
        let record = store.add_job("q", job).await.unwrap();
        assert_eq!(record.state, JobState::Delayed);

        assert!(store.claim_jobs("q", "w", 1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let claimed = store.claim_jobs("q", "w", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].name, "later");
    }

    #[tokio::test]
    async fn test_fail_retries_then_fails() {
        let store = InMemoryJobStore::new();
        let retention = RetentionPolicy::keep_all();
        let mut job = new_job("flaky");
        job.attempts = 2;
        job.backoff = BackoffSpec::fixed(Duration::ZERO);
        store.add_job("q", job).await.unwrap();

        store.claim_jobs("q", "w", 1).await.unwrap();
        let outcome = store
            .fail_job("q", "1", "boom 1", true, &retention)
            .await
            .unwrap();
        assert!(outcome.will_retry());

        let record = store.get_job("q", "1").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.attempts_made, 1);

        store.claim_jobs("q", "w", 1).await.unwrap();
        let outcome = store
            .fail_job("q", "1", "boom 2", true, &retention)
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Failed { attempts_made: 2 });

        let record = store.get_job("q", "1").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.failed_reason.as_deref(), Some("boom 2"));
        assert_eq!(record.error_history, vec!["boom 1", "boom 2"]);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_backoff_delays_retry() {
        let store = InMemoryJobStore::new();
        let mut job = new_job("slow-retry");
        job.backoff = BackoffSpec::fixed(Duration::from_secs(60));
        store.add_job("q", job).await.unwrap();

        store.claim_jobs("q", "w", 1).await.unwrap();
        let outcome = store
            .fail_job("q", "1", "boom", true, &RetentionPolicy::default())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FailureOutcome::WillRetry {
                attempts_made: 1,
                delay: Duration::from_secs(60)
            }
        );
        let record = store.get_job("q", "1").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Delayed);
        assert!(store.claim_jobs("q", "w", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_refuses_active_job() {
        let store = InMemoryJobStore::new();
        store.add_job("q", new_job("a")).await.unwrap();
        store.add_job("q", new_job("b")).await.unwrap();

        store.claim_jobs("q", "w", 1).await.unwrap();

        assert!(!store.remove_job("q", "1").await.unwrap());
        assert!(store.remove_job("q", "2").await.unwrap());
        assert!(!store.remove_job("q", "2").await.unwrap());
        assert!(!store.remove_job("missing", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_failed_job_resets_attempts() {
        let store = InMemoryJobStore::new();
        let retention = RetentionPolicy::keep_all();
        store.add_job("q", new_job("a")).await.unwrap();

        // Only failed jobs can be retried
        assert!(!store.retry_job("q", "1").await.unwrap());

        store.claim_jobs("q", "w", 1).await.unwrap();
        store
            .fail_job("q", "1", "fatal", false, &retention)
            .await
            .unwrap();

        assert!(store.retry_job("q", "1").await.unwrap());
        let record = store.get_job("q", "1").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.attempts_made, 0);
        assert_eq!(record.failed_reason, None);
        assert_eq!(record.error_history, vec!["fatal"]);
    }

    #[tokio::test]
    async fn test_completed_retention_by_count() {
        let store = InMemoryJobStore::new();
        let retention = RetentionPolicy {
            completed: KeepJobs::all().with_count(2),
            failed: KeepJobs::all(),
        };

        for i in 0..4 {
            store.add_job("q", new_job(&format!("job-{}", i))).await.unwrap();
        }
        for job in store.claim_jobs("q", "w", 4).await.unwrap() {
            store
                .complete_job("q", &job.id, json!({ "ok": true }), &retention)
                .await
                .unwrap();
        }

        let completed = store
            .list_jobs("q", JobState::Completed, Pagination::default())
            .await
            .unwrap();
        let names: Vec<&str> = completed.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["job-3", "job-2"]);
    }

    #[tokio::test]
    async fn test_counts_report_paused_waiting_jobs() {
        let store = InMemoryJobStore::new();
        store.add_job("q", new_job("a")).await.unwrap();
        store.add_job("q", new_job("b")).await.unwrap();
        let mut delayed = new_job("c");
        delayed.delay = Duration::from_secs(60);
        store.add_job("q", delayed).await.unwrap();

        let counts = store.job_counts("q").await.unwrap();
        assert_eq!(counts.waiting, 2);
        assert_eq!(counts.delayed, 1);

        store.pause_queue("q").await.unwrap();
        assert!(store.is_paused("q").await.unwrap());
        assert!(store.claim_jobs("q", "w", 10).await.unwrap().is_empty());

        let counts = store.job_counts("q").await.unwrap();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.paused, 2);

        store.resume_queue("q").await.unwrap();
        assert_eq!(store.claim_jobs("q", "w", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_jobs_paginates() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store.add_job("q", new_job(&format!("job-{}", i))).await.unwrap();
        }

        let page = store
            .list_jobs("q", JobState::Waiting, Pagination::range(1, 2))
            .await
            .unwrap();
        let names: Vec<&str> = page.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["job-1", "job-2"]);
    }

    #[tokio::test]
    async fn test_wait_for_job_wakes_on_add() {
        let store = std::sync::Arc::new(InMemoryJobStore::new());

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let started = std::time::Instant::now();
                store.wait_for_job("q", Duration::from_secs(10)).await.unwrap();
                started.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.add_job("q", new_job("wake")).await.unwrap();

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(5));
    }
}
