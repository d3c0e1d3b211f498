//! Queue factory
//!
//! Owns the queue handles (one per name, cached) and the workers bound to
//! them, and the connection to the job store they share.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{QueueDefaults, QueueHandle};
use crate::job::JobOptions;
use crate::persistence::{JobCounts, JobStore, StoreError};
use crate::processor::Processor;
use crate::worker::{Worker, WorkerError, WorkerOptions};

/// Snapshot of the factory caches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryStatus {
    /// Cached queue names, sorted
    pub queues: Vec<String>,
    /// Number of live workers
    pub workers: usize,
}

/// Creates and caches queue handles and workers
pub struct QueueFactory {
    store: Arc<dyn JobStore>,
    defaults: QueueDefaults,
    queues: Mutex<HashMap<String, QueueHandle>>,
    workers: Mutex<Vec<Arc<Worker>>>,
}

impl QueueFactory {
    /// Create a factory with the standard defaults
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_defaults(store, QueueDefaults::default())
    }

    pub fn with_defaults(store: Arc<dyn JobStore>, defaults: QueueDefaults) -> Self {
        Self {
            store,
            defaults,
            queues: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn defaults(&self) -> &QueueDefaults {
        &self.defaults
    }

    /// Get or create the queue handle for `name`
    pub fn create_queue(&self, name: &str) -> QueueHandle {
        self.create_queue_with(name, &JobOptions::default())
    }

    /// Get or create the queue handle for `name`
    ///
    /// `job_options` become the queue's default job options when the queue is
    /// created; a cached queue keeps the options it was created with.
    pub fn create_queue_with(&self, name: &str, job_options: &JobOptions) -> QueueHandle {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(name) {
            return queue.clone();
        }

        let queue = QueueHandle::new(
            name,
            Arc::clone(&self.store),
            self.defaults.clone(),
            job_options.clone(),
        );
        queues.insert(name.to_string(), queue.clone());
        drop(queues);

        debug!(queue = name, "created queue");
        self.check_connection(name);
        queue
    }

    /// Log store connection problems without failing the caller
    fn check_connection(&self, name: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = Arc::clone(&self.store);
        let queue = name.to_string();
        runtime.spawn(async move {
            if let Err(e) = store.ping().await {
                error!(queue = %queue, error = %e, "queue connection error");
            }
        });
    }

    /// Cached queue handle for `name`, if any
    pub fn queue(&self, name: &str) -> Option<QueueHandle> {
        self.queues.lock().get(name).cloned()
    }

    /// Start a new worker on `name`'s queue
    ///
    /// Workers are not deduplicated: every call starts another one.
    pub fn create_worker(
        &self,
        name: &str,
        processor: Processor,
        options: WorkerOptions,
    ) -> Result<Arc<Worker>, WorkerError> {
        let queue = self.create_queue(name);
        let worker = Worker::start(queue, processor, options)?;
        self.workers.lock().push(Arc::clone(&worker));
        Ok(worker)
    }

    /// Job counts for a cached queue; `None` if no queue is cached for `name`
    pub async fn get_queue_metrics(&self, name: &str) -> Result<Option<JobCounts>, StoreError> {
        match self.queue(name) {
            Some(queue) => queue.counts().await.map(Some),
            None => Ok(None),
        }
    }

    /// Close every worker, then every queue, and clear both caches
    ///
    /// Workers drain their in-flight jobs (up to their shutdown timeout)
    /// before the queues close. Errors are logged, never returned.
    pub async fn close_all(&self) {
        let workers: Vec<Arc<Worker>> = std::mem::take(&mut *self.workers.lock());
        let queues: Vec<QueueHandle> = self.queues.lock().drain().map(|(_, q)| q).collect();

        info!(
            workers = workers.len(),
            queues = queues.len(),
            "closing queues and workers"
        );

        for worker in &workers {
            if let Err(e) = worker.close().await {
                warn!(
                    queue = worker.queue_name(),
                    worker_id = worker.id(),
                    error = %e,
                    "worker did not close cleanly"
                );
            }
        }

        for queue in &queues {
            queue.close();
        }
    }

    /// Snapshot of cached queues and live workers
    pub fn status(&self) -> FactoryStatus {
        let mut queues: Vec<String> = self.queues.lock().keys().cloned().collect();
        queues.sort();
        FactoryStatus {
            queues,
            workers: self.workers.lock().len(),
        }
    }
}
