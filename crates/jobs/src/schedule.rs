//! Recurring job schedules
//!
//! A recurring job is a chain of delayed occurrences. Only the next occurrence
//! exists in the store at any time; when a worker claims it, the following one
//! is enqueued. Occurrence ids are derived from the job name and the scheduled
//! time, so several processes scheduling the same occurrence produce one job.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use serde::{Deserialize, Serialize};

const MAX_PATTERN_LENGTH: usize = 256;

/// Schedule errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid time zone '{tz}': {reason}")]
    InvalidTimezone { tz: String, reason: String },

    #[error("schedule '{0}' has no upcoming occurrence")]
    Exhausted(String),
}

/// When a recurring job repeats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatOptions {
    /// Cron pattern; a leading seconds field is optional
    pub pattern: String,

    /// Maximum number of occurrences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,

    /// IANA time zone the pattern is evaluated in (UTC when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
}

impl RepeatOptions {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            limit: None,
            start_date: None,
            end_date: None,
            tz: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_start_date(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self
    }

    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    pub fn with_tz(mut self, tz: impl Into<String>) -> Self {
        self.tz = Some(tz.into());
        self
    }

    /// Check the pattern and time zone without computing an occurrence
    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.cron()?;
        self.timezone()?;
        Ok(())
    }

    /// First occurrence strictly after `after`, honoring start and end dates
    pub fn next_occurrence(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let cron = self.cron()?;
        let tz = self.timezone()?;

        let (from, inclusive) = match self.start_date {
            Some(start) if start > after => (start, true),
            _ => (after, false),
        };

        let next = match cron.find_next_occurrence(&from.with_timezone(&tz), inclusive) {
            Ok(next) => next.with_timezone(&Utc),
            // croner gives up when no match exists in its search window
            Err(_) => return Ok(None),
        };

        match self.end_date {
            Some(end) if next > end => Ok(None),
            _ => Ok(Some(next)),
        }
    }

    fn cron(&self) -> Result<Cron, ScheduleError> {
        if self.pattern.len() > MAX_PATTERN_LENGTH {
            return Err(ScheduleError::InvalidPattern {
                pattern: self.pattern.clone(),
                reason: format!("longer than {} characters", MAX_PATTERN_LENGTH),
            });
        }

        Cron::new(&self.pattern)
            .with_seconds_optional()
            .parse()
            .map_err(|e| ScheduleError::InvalidPattern {
                pattern: self.pattern.clone(),
                reason: e.to_string(),
            })
    }

    fn timezone(&self) -> Result<Tz, ScheduleError> {
        match &self.tz {
            None => Ok(Tz::UTC),
            Some(tz) => tz.parse::<Tz>().map_err(|e| ScheduleError::InvalidTimezone {
                tz: tz.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Repeat bookkeeping carried by each occurrence of a recurring job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatState {
    /// Recurring job name
    pub key: String,
    pub options: RepeatOptions,
    /// 1-based occurrence number
    pub count: u32,
    pub scheduled_for: DateTime<Utc>,
}

impl RepeatState {
    /// State of the first occurrence after `now`
    pub fn first(
        key: impl Into<String>,
        options: RepeatOptions,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, ScheduleError> {
        if options.limit == Some(0) {
            return Ok(None);
        }

        Ok(options.next_occurrence(now)?.map(|at| Self {
            key: key.into(),
            options,
            count: 1,
            scheduled_for: at,
        }))
    }

    /// State of the occurrence following this one
    pub fn next(&self) -> Result<Option<Self>, ScheduleError> {
        if let Some(limit) = self.options.limit {
            if self.count >= limit {
                return Ok(None);
            }
        }

        Ok(self
            .options
            .next_occurrence(self.scheduled_for)?
            .map(|at| Self {
                key: self.key.clone(),
                options: self.options.clone(),
                count: self.count + 1,
                scheduled_for: at,
            }))
    }

    /// Deterministic job id of this occurrence
    pub fn job_id(&self) -> String {
        format!("repeat:{}:{}", self.key, self.scheduled_for.timestamp_millis())
    }
}
