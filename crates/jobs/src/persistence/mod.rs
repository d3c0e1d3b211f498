//! Persistence layer for job queues
//!
//! This module provides:
//! - [`JobStore`] trait for job persistence and claiming
//! - [`InMemoryJobStore`] for testing and single-process use
//! - [`PostgresJobStore`] for production
//! - [`RetentionPolicy`] applied when jobs finish

mod memory;
mod postgres;
mod retention;
mod store;

use std::time::Duration;

use chrono::{DateTime, Utc};

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use retention::{KeepJobs, RetentionPolicy};
pub use store::{FailureOutcome, JobCounts, JobStore, Pagination, StoreError};

/// Time at which something deferred by `delay` from `now` becomes due
pub(crate) fn due_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
