//! Job records, states, priorities and enqueue options

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::payload::JobData;
use crate::reliability::BackoffSpec;
use crate::schedule::RepeatState;
use crate::serde_millis::option_duration_millis;

/// Store-assigned job identifier, unique within a queue
pub type JobId = String;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for dequeue
    Waiting,
    /// Claimed by a worker and being processed
    Active,
    /// Processor succeeded
    Completed,
    /// Processor failed and no attempts remain
    Failed,
    /// Waiting for a delay (initial or backoff) to elapse
    Delayed,
}

impl JobState {
    /// Every state, in lifecycle order
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Delayed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }

    /// Whether the job has reached the end of its lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown job state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct UnknownJobState(pub String);

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "delayed" => Ok(Self::Delayed),
            other => Err(UnknownJobState(other.to_string())),
        }
    }
}

/// Fixed priority levels
///
/// Lower numeric values dequeue first; ties are broken by insertion order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Numeric value stored with the job
    pub const fn value(self) -> i32 {
        match self {
            Self::Critical => -10,
            Self::High => -5,
            Self::Normal => 0,
            Self::Low => 10,
        }
    }
}

impl From<JobPriority> for i32 {
    fn from(priority: JobPriority) -> Self {
        priority.value()
    }
}

/// Per-job options supplied at enqueue time
///
/// Unset fields fall back to the queue's default job options, then to the
/// factory defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Caller-chosen id; adding an id that already exists is a no-op
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,

    /// Numeric priority (see [`JobPriority`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Defer eligibility by this long
    #[serde(
        default,
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub delay: Option<Duration>,

    /// Total attempts including the first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Delay policy between attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffSpec>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority level
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority.value());
        self
    }

    /// Set a raw numeric priority
    pub fn with_priority_value(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the initial delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set the number of attempts
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: BackoffSpec) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Set a caller-chosen job id
    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Fill unset fields from `defaults`
    pub fn or_defaults(self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            job_id: self.job_id.or_else(|| defaults.job_id.clone()),
            priority: self.priority.or(defaults.priority),
            delay: self.delay.or(defaults.delay),
            attempts: self.attempts.or(defaults.attempts),
            backoff: self.backoff.or_else(|| defaults.backoff.clone()),
        }
    }
}

/// A fully resolved job, ready to be written to a store
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_id: Option<JobId>,
    pub name: String,
    pub data: Value,
    pub priority: i32,
    pub delay: Duration,
    pub attempts: u32,
    pub backoff: BackoffSpec,
    pub repeat: Option<RepeatState>,
}

impl NewJob {
    /// State the job enters when added
    pub fn initial_state(&self) -> JobState {
        if self.delay.is_zero() {
            JobState::Waiting
        } else {
            JobState::Delayed
        }
    }
}

/// One unit of enqueued work as held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub queue_name: String,
    pub name: String,
    pub data: Value,
    pub priority: i32,
    /// Total attempts allowed
    pub attempts: u32,
    pub backoff: BackoffSpec,
    pub state: JobState,
    /// Failed attempts so far
    pub attempts_made: u32,
    pub result: Option<Value>,
    pub failed_reason: Option<String>,
    /// One entry per failed attempt
    pub error_history: Vec<String>,
    pub repeat: Option<RepeatState>,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be dequeued
    pub available_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Decode the job data into a typed envelope
    pub fn payload<P: DeserializeOwned>(&self) -> Result<JobData<P>, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_values_order() {
        assert_eq!(JobPriority::Critical.value(), -10);
        assert_eq!(JobPriority::High.value(), -5);
        assert_eq!(JobPriority::Normal.value(), 0);
        assert_eq!(JobPriority::Low.value(), 10);

        assert!(JobPriority::Critical.value() < JobPriority::High.value());
        assert!(JobPriority::High.value() < JobPriority::Normal.value());
        assert!(JobPriority::Normal.value() < JobPriority::Low.value());
    }

    #[test]
    fn test_state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Delayed.is_terminal());
    }

    #[test]
    fn test_options_fall_back_to_defaults() {
        let defaults = JobOptions::new()
            .with_attempts(3)
            .with_backoff(BackoffSpec::exponential(Duration::from_secs(5)))
            .with_priority(JobPriority::Low);

        let merged = JobOptions::new()
            .with_priority(JobPriority::Critical)
            .or_defaults(&defaults);

        assert_eq!(merged.priority, Some(-10));
        assert_eq!(merged.attempts, Some(3));
        assert_eq!(
            merged.backoff,
            Some(BackoffSpec::exponential(Duration::from_secs(5)))
        );
        assert_eq!(merged.delay, None);
    }

    #[test]
    fn test_new_job_initial_state() {
        let mut job = NewJob {
            job_id: None,
            name: "test".to_string(),
            data: Value::Null,
            priority: 0,
            delay: Duration::ZERO,
            attempts: 1,
            backoff: BackoffSpec::default(),
            repeat: None,
        };
        assert_eq!(job.initial_state(), JobState::Waiting);

        job.delay = Duration::from_millis(10);
        assert_eq!(job.initial_state(), JobState::Delayed);
    }

    #[test]
    fn test_options_serialize_camel_case() {
        let options = JobOptions::new()
            .with_job_id("abc")
            .with_delay(Duration::from_secs(1));
        let json = serde_json::to_value(&options).unwrap();

        assert_eq!(json["jobId"], "abc");
        assert_eq!(json["delay"], 1000);
        assert!(json.get("attempts").is_none());
    }
}
