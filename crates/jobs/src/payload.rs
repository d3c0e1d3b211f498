//! Typed job payloads
//!
//! Every job's data is a [`JobData`] envelope: common metadata fields next to
//! the queue-specific payload, flattened into one JSON object.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::job::JobPriority;

/// A payload type bound to the queue that processes it
///
/// # Example
///
/// ```
/// use atcdrill_jobs::JobPayload;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Transcode {
///     recording_id: String,
/// }
///
/// impl JobPayload for Transcode {
///     const QUEUE: &'static str = "transcode";
/// }
/// ```
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of the queue this payload is enqueued on
    const QUEUE: &'static str;
}

/// Job data envelope: shared metadata plus the queue-specific payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData<P> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Used as the job priority when the enqueue options leave it unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<JobPriority>,

    #[serde(flatten)]
    pub payload: P,
}

impl<P> JobData<P> {
    /// Wrap a payload, stamped with the current time
    pub fn new(payload: P) -> Self {
        Self {
            user_id: None,
            timestamp: Some(Utc::now()),
            correlation_id: None,
            priority: None,
            payload,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}
