//! Queues and the factory that owns them
//!
//! This module provides:
//! - [`QueueFactory`] - one cached [`QueueHandle`] per queue name plus the
//!   workers bound to those queues
//! - [`QueueHandle`] - enqueue, inspect and administer one queue
//! - [`QueueDefaults`] - defaults applied to every job and queue
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use atcdrill_jobs::{InMemoryJobStore, QueueFactory};
//!
//! let factory = QueueFactory::new(Arc::new(InMemoryJobStore::new()));
//! let queue = factory.create_queue("email");
//! assert_eq!(queue.name(), "email");
//! assert!(factory.queue("email").is_some());
//! ```

mod factory;
mod handle;

use std::time::Duration;

use crate::persistence::{RetentionPolicy, StoreError};
use crate::reliability::BackoffSpec;
use crate::schedule::ScheduleError;

pub use factory::{FactoryStatus, QueueFactory};
pub use handle::{BulkJob, QueueHandle};

/// Defaults applied by the factory to every queue it creates
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefaults {
    /// Total attempts per job, including the first
    pub attempts: u32,

    /// Delay policy between attempts
    pub backoff: BackoffSpec,

    /// Retention of finished jobs
    pub retention: RetentionPolicy,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffSpec::exponential(Duration::from_secs(2)),
            retention: RetentionPolicy::default(),
        }
    }
}

impl QueueDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSpec) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Enqueue to a queue with no registered definition
    #[error("queue {0} is not registered")]
    NotRegistered(String),

    /// Recurring job schedule error
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Job data could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_queue_defaults() {
        let defaults = QueueDefaults::default();
        assert_eq!(defaults.attempts, 3);
        assert_eq!(
            defaults.backoff,
            BackoffSpec::exponential(Duration::from_secs(2))
        );
        assert_eq!(defaults.retention, RetentionPolicy::default());
    }

    #[test]
    fn test_attempts_at_least_one() {
        assert_eq!(QueueDefaults::new().with_attempts(0).attempts, 1);
    }
}
