// Worker process configuration

use std::time::Duration;

use uuid::Uuid;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the job worker process
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// PostgreSQL connection string; the in-memory store is used when unset
    pub database_url: Option<String>,
    /// Identifier of this process in logs
    pub worker_id: String,
    /// How long each queue's worker waits for in-flight jobs on shutdown
    pub shutdown_timeout: Duration,
    /// Replaces every queue's configured concurrency when set
    pub concurrency_override: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            worker_id: format!("worker-{}", Uuid::now_v7()),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            concurrency_override: None,
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `WORKER_ID`: Process identifier (default: `worker-{uuid}`)
    /// - `JOB_SHUTDOWN_TIMEOUT_SECS`: Graceful shutdown timeout (default: 30)
    /// - `JOB_CONCURRENCY_OVERRIDE`: Concurrency for every queue
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            worker_id: lookup("WORKER_ID").unwrap_or(defaults.worker_id),
            shutdown_timeout: lookup("JOB_SHUTDOWN_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            concurrency_override: lookup("JOB_CONCURRENCY_OVERRIDE")
                .and_then(|s| s.parse().ok())
                .filter(|&n: &usize| n > 0),
        }
    }
}
