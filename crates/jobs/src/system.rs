//! Queue system
//!
//! Composes the registry, the factory and the service into one explicitly
//! constructed object with an `initialize`/`shutdown` lifecycle. Hosting
//! processes create one per store; tests create as many as they like.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::discovery::{load_job_modules, DiscoveryReport, JobModule};
use crate::persistence::JobStore;
use crate::queue::{FactoryStatus, QueueDefaults, QueueFactory};
use crate::registry::{QueueDefinition, QueueRegistry, RegistryError, RegistryStatus};
use crate::service::QueueService;

/// Read-only snapshot for operational dashboards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSystemStatus {
    pub registry: RegistryStatus,
    pub factory: FactoryStatus,
}

/// Registry, factory and service over one job store
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use atcdrill_jobs::{InMemoryJobStore, JobOptions, QueueDefinition, QueueSystem};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> anyhow::Result<()> {
/// let system = QueueSystem::new(Arc::new(InMemoryJobStore::new()));
/// system
///     .register(QueueDefinition::new("echo", |job| async move {
///         Ok(json!({ "received": job.data }))
///     }))
///     .await?;
/// system.initialize().await?;
///
/// let job = system
///     .service()
///     .add_job("echo", json!({ "value": 42 }), JobOptions::new())
///     .await?;
/// assert_eq!(job.queue_name, "echo");
///
/// system.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueueSystem {
    registry: Arc<RwLock<QueueRegistry>>,
    factory: Arc<QueueFactory>,
}

impl QueueSystem {
    /// Create a queue system with the standard defaults
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_defaults(store, QueueDefaults::default())
    }

    pub fn with_defaults(store: Arc<dyn JobStore>, defaults: QueueDefaults) -> Self {
        let factory = Arc::new(QueueFactory::with_defaults(store, defaults));
        let registry = Arc::new(RwLock::new(QueueRegistry::new(Arc::clone(&factory))));
        Self { registry, factory }
    }

    pub async fn register(&self, definition: QueueDefinition) -> Result<(), RegistryError> {
        self.registry.write().await.register(definition)
    }

    /// Load discovered job modules into the registry
    pub async fn load_modules<C>(&self, modules: &[JobModule<C>], ctx: &C) -> DiscoveryReport {
        let mut registry = self.registry.write().await;
        load_job_modules(&mut registry, modules, ctx)
    }

    /// Start a queue and worker per registered definition; idempotent
    pub async fn initialize(&self) -> Result<(), RegistryError> {
        self.registry.write().await.initialize()?;
        info!("Queue system initialized");
        Ok(())
    }

    /// Drain and close every worker and queue
    pub async fn shutdown(&self) {
        self.registry.write().await.shutdown().await;
        info!("Queue system shut down");
    }

    pub async fn status(&self) -> QueueSystemStatus {
        QueueSystemStatus {
            registry: self.registry.read().await.status(),
            factory: self.factory.status(),
        }
    }

    pub fn service(&self) -> QueueService {
        QueueService::new(Arc::clone(&self.registry), Arc::clone(&self.factory))
    }

    pub fn factory(&self) -> &Arc<QueueFactory> {
        &self.factory
    }

    pub fn registry(&self) -> &Arc<RwLock<QueueRegistry>> {
        &self.registry
    }
}
