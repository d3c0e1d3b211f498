//! Processor contract
//!
//! A processor is the per-queue function that performs the work for one job.
//! Returning `Ok(value)` completes the job with `value` as its result;
//! returning a [`JobError`] counts as a failed attempt.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobRecord;
use crate::payload::{JobData, JobPayload};

/// Error type for job failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the job on the current attempt regardless of
    /// the attempts remaining.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<Value>,
}

impl JobError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{}: {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for JobError {}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{:#}", err))
    }
}

/// Processor outcome
pub type JobResult = Result<Value, JobError>;

/// Type-erased processor shared by every worker of a queue
pub type Processor = Arc<dyn Fn(JobRecord) -> BoxFuture<'static, JobResult> + Send + Sync>;

/// Wrap an async function over raw job records as a [`Processor`]
pub fn processor_fn<F, Fut>(f: F) -> Processor
where
    F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    Arc::new(move |job| Box::pin(f(job)))
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A job whose data has been decoded into its queue's payload type
#[derive(Debug, Clone)]
pub struct TypedJob<P> {
    pub record: JobRecord,
    pub data: JobData<P>,
}

/// Wrap an async function over typed jobs as a [`Processor`]
///
/// Data that does not decode as `P` fails the job without retrying.
pub fn typed_processor<P, F, Fut>(f: F) -> Processor
where
    P: JobPayload,
    F: Fn(TypedJob<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |record: JobRecord| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let data = record.payload::<P>().map_err(|e| {
                JobError::non_retryable(format!("invalid {} payload: {}", P::QUEUE, e))
                    .with_type("INVALID_PAYLOAD")
            })?;
            f(TypedJob { record, data }).await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = JobError::retryable("smtp timeout").with_type("TIMEOUT");
        assert!(err.retryable);
        assert_eq!(err.to_string(), "TIMEOUT: smtp timeout");

        let err = JobError::non_retryable("bad address");
        assert!(!err.retryable);
        assert_eq!(err.to_string(), "bad address");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(&*payload), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(&*payload), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }

    #[test]
    fn test_anyhow_conversion_is_retryable() {
        let err: JobError = anyhow::anyhow!("connection reset").into();
        assert!(err.retryable);
        assert_eq!(err.message, "connection reset");
    }
}
