//! Retention of finished jobs

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serde_millis::option_duration_millis;

/// How many finished jobs of one kind to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepJobs {
    /// Drop jobs that finished longer ago than this
    #[serde(default, with = "option_duration_millis")]
    pub age: Option<Duration>,

    /// Keep at most this many of the most recently finished jobs
    #[serde(default)]
    pub count: Option<usize>,
}

impl KeepJobs {
    /// Keep everything
    pub fn all() -> Self {
        Self {
            age: None,
            count: None,
        }
    }

    pub fn with_age(mut self, age: Duration) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Finish time before which jobs are dropped
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| now - age)
    }
}

/// Retention applied when jobs reach a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub completed: KeepJobs,
    pub failed: KeepJobs,
}

impl Default for RetentionPolicy {
    /// Completed jobs: 24 hours, at most 100. Failed jobs: 7 days.
    fn default() -> Self {
        Self {
            completed: KeepJobs::all()
                .with_age(Duration::from_secs(24 * 60 * 60))
                .with_count(100),
            failed: KeepJobs::all().with_age(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

impl RetentionPolicy {
    /// Keep every finished job
    pub fn keep_all() -> Self {
        Self {
            completed: KeepJobs::all(),
            failed: KeepJobs::all(),
        }
    }
}
