//! # Background Job Queue
//!
//! Durable, priority-ordered, retry-capable work queues for side effects that
//! should not run inside a request (email delivery and the like).
//!
//! ## Features
//!
//! - **Queue registry**: feature modules register queue definitions at startup;
//!   duplicates and late registrations are rejected
//! - **Discovery**: job modules are collected into a build-time manifest and
//!   loaded with per-module fault isolation
//! - **Priorities and delays**: lower priority values dequeue first, ties in
//!   insertion order
//! - **Automatic retries**: per-job attempts with exponential or fixed backoff
//! - **Recurring jobs**: cron patterns with optional time zone, limits and
//!   start/end dates
//! - **Stores**: in-memory for tests, PostgreSQL (`SKIP LOCKED`) for production
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        QueueSystem                           │
//! │   QueueRegistry (definitions)    QueueService (enqueue API)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       QueueFactory                           │
//! │   one QueueHandle per name          Workers (concurrency N)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         JobStore                             │
//! │   (InMemoryJobStore | PostgresJobStore: job_queue_jobs)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use atcdrill_jobs::prelude::*;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Transcode {
//!     recording_id: String,
//! }
//!
//! impl JobPayload for Transcode {
//!     const QUEUE: &'static str = "transcode";
//! }
//!
//! let system = QueueSystem::new(store);
//! system
//!     .register(
//!         QueueDefinition::for_payload::<Transcode, _, _>(|job| async move {
//!             transcode(&job.data.payload.recording_id).await?;
//!             Ok(json!({ "done": true }))
//!         })
//!         .with_concurrency(2),
//!     )
//!     .await?;
//! system.initialize().await?;
//!
//! system
//!     .service()
//!     .add(JobData::new(Transcode { recording_id: "r-1".into() }), JobOptions::new())
//!     .await?;
//! ```

pub mod discovery;
pub mod job;
pub mod payload;
pub mod persistence;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod reliability;
pub mod schedule;
pub mod service;
pub mod system;
pub mod worker;

mod serde_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::discovery::{load_job_modules, DiscoveryReport, JobModule};
    pub use crate::job::{JobOptions, JobPriority, JobRecord, JobState};
    pub use crate::payload::{JobData, JobPayload};
    pub use crate::persistence::{InMemoryJobStore, JobStore, PostgresJobStore, StoreError};
    pub use crate::processor::{JobError, JobResult, TypedJob};
    pub use crate::queue::{BulkJob, QueueError};
    pub use crate::registry::{QueueDefinition, QueueRegistry, RegistryError};
    pub use crate::reliability::BackoffSpec;
    pub use crate::schedule::RepeatOptions;
    pub use crate::service::QueueService;
    pub use crate::system::QueueSystem;
    pub use crate::worker::WorkerOptions;
}

// Re-export key types at crate root
pub use discovery::{load_job_modules, DiscoveryReport, JobModule, RegisterFn};
pub use job::{JobId, JobOptions, JobPriority, JobRecord, JobState, NewJob};
pub use payload::{JobData, JobPayload};
pub use persistence::{
    FailureOutcome, InMemoryJobStore, JobCounts, JobStore, KeepJobs, Pagination,
    PostgresJobStore, RetentionPolicy, StoreError,
};
pub use processor::{processor_fn, typed_processor, JobError, JobResult, Processor, TypedJob};
pub use queue::{BulkJob, FactoryStatus, QueueDefaults, QueueError, QueueFactory, QueueHandle};
pub use registry::{QueueDefinition, QueueRegistry, RegistryError, RegistryStatus};
pub use reliability::{BackoffKind, BackoffSpec};
pub use schedule::{RepeatOptions, RepeatState, ScheduleError};
pub use service::QueueService;
pub use system::{QueueSystem, QueueSystemStatus};
pub use worker::{PollerConfig, Worker, WorkerError, WorkerEvent, WorkerOptions, WorkerStatus};
