//! Queue registry
//!
//! The registry is the catalog of queue definitions supplied by feature
//! modules at startup. Feature modules that own a queue register it; modules
//! that enqueue work only need the queue name. Once initialized, the registry
//! refuses further registrations.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::job::{JobOptions, JobRecord};
use crate::payload::JobPayload;
use crate::processor::{processor_fn, typed_processor, JobResult, Processor, TypedJob};
use crate::queue::QueueFactory;
use crate::worker::{WorkerError, WorkerOptions};

/// Definition of one logical queue
#[derive(Clone)]
pub struct QueueDefinition {
    /// Unique queue name
    pub name: String,

    /// Per-job handler
    pub processor: Processor,

    /// Options for the queue's worker
    pub worker_options: WorkerOptions,

    /// Defaults for jobs enqueued on this queue
    pub default_job_options: JobOptions,
}

impl QueueDefinition {
    /// Define a queue whose processor works on raw job records
    ///
    /// # Example
    ///
    /// ```
    /// use atcdrill_jobs::QueueDefinition;
    /// use serde_json::json;
    ///
    /// let echo = QueueDefinition::new("echo", |job| async move {
    ///     Ok(json!({ "received": job.data }))
    /// });
    /// assert_eq!(echo.name, "echo");
    /// ```
    pub fn new<F, Fut>(name: impl Into<String>, processor: F) -> Self
    where
        F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Self::with_processor(name, processor_fn(processor))
    }

    /// Define a queue from an already type-erased processor
    pub fn with_processor(name: impl Into<String>, processor: Processor) -> Self {
        Self {
            name: name.into(),
            processor,
            worker_options: WorkerOptions::default(),
            default_job_options: JobOptions::default(),
        }
    }

    /// Define the queue for payload type `P`, named `P::QUEUE`
    pub fn for_payload<P, F, Fut>(processor: F) -> Self
    where
        P: JobPayload,
        F: Fn(TypedJob<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Self::with_processor(P::QUEUE, typed_processor::<P, F, Fut>(processor))
    }

    pub fn with_worker_options(mut self, options: WorkerOptions) -> Self {
        self.worker_options = options;
        self
    }

    /// Set the worker concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_options.concurrency = concurrency;
        self
    }

    pub fn with_default_job_options(mut self, options: JobOptions) -> Self {
        self.default_job_options = options;
        self
    }
}

impl fmt::Debug for QueueDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDefinition")
            .field("name", &self.name)
            .field("worker_options", &self.worker_options)
            .field("default_job_options", &self.default_job_options)
            .finish_non_exhaustive()
    }
}

/// Registry status snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub initialized: bool,
    pub queue_count: usize,
    /// Registered queue names, sorted
    pub queues: Vec<String>,
}

/// Catalog of queue definitions
pub struct QueueRegistry {
    factory: Arc<QueueFactory>,
    definitions: BTreeMap<String, QueueDefinition>,
    /// Definitions whose queue and worker exist
    started: HashSet<String>,
    initialized: bool,
}

impl QueueRegistry {
    /// Create an empty registry backed by `factory`
    pub fn new(factory: Arc<QueueFactory>) -> Self {
        Self {
            factory,
            definitions: BTreeMap::new(),
            started: HashSet::new(),
            initialized: false,
        }
    }

    pub fn factory(&self) -> &Arc<QueueFactory> {
        &self.factory
    }

    /// Register a queue definition
    pub fn register(&mut self, definition: QueueDefinition) -> Result<(), RegistryError> {
        if self.initialized {
            return Err(RegistryError::AlreadyInitialized(definition.name));
        }
        if self.definitions.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateQueue(definition.name));
        }

        info!(queue = %definition.name, "Registered queue");
        self.definitions.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Create a queue and start a worker for every registered definition
    ///
    /// Calling this again after success is a no-op. If a worker cannot be
    /// started, the queues and workers started so far stay up, the registry
    /// stays uninitialized and the error is returned; a later call starts only
    /// the definitions that are still missing.
    pub fn initialize(&mut self) -> Result<(), RegistryError> {
        if self.initialized {
            info!("Queue registry already initialized");
            return Ok(());
        }

        for definition in self.definitions.values() {
            if self.started.contains(&definition.name) {
                continue;
            }

            self.factory
                .create_queue_with(&definition.name, &definition.default_job_options);
            self.factory
                .create_worker(
                    &definition.name,
                    Arc::clone(&definition.processor),
                    definition.worker_options.clone(),
                )
                .map_err(|source| {
                    error!(queue = %definition.name, error = %source, "Failed to start worker");
                    RegistryError::Worker {
                        queue: definition.name.clone(),
                        source,
                    }
                })?;
            self.started.insert(definition.name.clone());
        }

        self.initialized = true;
        info!(queues = self.definitions.len(), "Queue registry initialized");
        Ok(())
    }

    /// Close every queue and worker
    ///
    /// Definitions stay registered, so the registry can be initialized again.
    pub async fn shutdown(&mut self) {
        self.factory.close_all().await;
        self.started.clear();
        self.initialized = false;
        info!("Queue registry shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn has(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&QueueDefinition> {
        self.definitions.get(name)
    }

    /// All definitions, ordered by name
    pub fn get_all(&self) -> Vec<&QueueDefinition> {
        self.definitions.values().collect()
    }

    /// Get the number of registered queues
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn status(&self) -> RegistryStatus {
        RegistryStatus {
            initialized: self.initialized,
            queue_count: self.definitions.len(),
            queues: self.definitions.keys().cloned().collect(),
        }
    }
}

impl fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.definitions.keys().collect::<Vec<_>>())
            .field("initialized", &self.initialized)
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A definition with this name is already registered
    #[error("queue {0} is already registered")]
    DuplicateQueue(String),

    /// Registration after initialization
    #[error("cannot register queue {0}: registry is already initialized")]
    AlreadyInitialized(String),

    /// A queue's worker could not be started
    #[error("failed to start worker for queue {queue}: {source}")]
    Worker {
        queue: String,
        #[source]
        source: WorkerError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryJobStore;
    use serde_json::json;

    fn registry() -> QueueRegistry {
        QueueRegistry::new(Arc::new(QueueFactory::new(Arc::new(InMemoryJobStore::new()))))
    }

    fn echo(name: &str) -> QueueDefinition {
        QueueDefinition::new(name, |job| async move { Ok(json!({ "received": job.data })) })
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let mut registry = registry();
        registry.register(echo("echo")).unwrap();

        let err = registry.register(echo("echo")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateQueue(name) if name == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_register_after_initialize_is_rejected() {
        let mut registry = registry();
        registry.register(echo("a")).unwrap();
        registry.initialize().unwrap();

        let err = registry.register(echo("b")).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyInitialized(_)));
        // A duplicate after initialize reports the initialize error
        assert!(matches!(
            registry.register(echo("a")),
            Err(RegistryError::AlreadyInitialized(_))
        ));
        assert!(!registry.has("b"));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let mut registry = registry();
        registry.register(echo("a")).unwrap();
        registry.register(echo("b")).unwrap();

        registry.initialize().unwrap();
        registry.initialize().unwrap();

        let status = registry.factory().status();
        assert_eq!(status.queues, vec!["a", "b"]);
        assert_eq!(status.workers, 2);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_and_accessors() {
        let mut registry = registry();
        registry
            .register(echo("email").with_concurrency(5))
            .unwrap();
        registry.register(echo("audit")).unwrap();

        assert!(registry.has("email"));
        assert!(!registry.has("sms"));
        assert_eq!(registry.get("email").map(|d| d.worker_options.concurrency), Some(5));

        let names: Vec<&str> = registry.get_all().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["audit", "email"]);

        assert_eq!(
            registry.status(),
            RegistryStatus {
                initialized: false,
                queue_count: 2,
                queues: vec!["audit".to_string(), "email".to_string()],
            }
        );
    }
}
