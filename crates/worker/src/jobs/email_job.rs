//! Email delivery queue
//!
//! Jobs carry the recipient, a template name and its variables; rendering and
//! delivery happen in the [`Mailer`](crate::mailer::Mailer).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use atcdrill_jobs::{
    BackoffSpec, JobError, JobOptions, JobPayload, JobResult, QueueDefinition, QueueRegistry,
    TypedJob,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::JobContext;
use crate::mailer::{EmailAttachment, EmailMessage, Mailer};

pub const CONCURRENCY: usize = 5;
pub const ATTEMPTS: u32 = 3;
pub const BACKOFF_DELAY: Duration = Duration::from_secs(5);

/// Payload of an `email` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailJobData {
    pub to: String,
    pub template: String,
    pub variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcc: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<EmailAttachment>>,
}

impl JobPayload for EmailJobData {
    const QUEUE: &'static str = "email";
}

pub fn register(registry: &mut QueueRegistry, ctx: &JobContext) -> anyhow::Result<()> {
    let mailer = Arc::clone(&ctx.mailer);

    let definition = QueueDefinition::for_payload::<EmailJobData, _, _>(move |job| {
        let mailer = Arc::clone(&mailer);
        async move { send_email(mailer.as_ref(), job).await }
    })
    .with_worker_options(ctx.worker_options(CONCURRENCY))
    .with_default_job_options(
        JobOptions::new()
            .with_attempts(ATTEMPTS)
            .with_backoff(BackoffSpec::exponential(BACKOFF_DELAY)),
    );

    registry
        .register(definition)
        .context("failed to register email queue")?;
    Ok(())
}

async fn send_email(mailer: &dyn Mailer, job: TypedJob<EmailJobData>) -> JobResult {
    let data = job.data.payload;
    if !data.to.contains('@') {
        return Err(
            JobError::non_retryable(format!("invalid recipient: {:?}", data.to))
                .with_type("INVALID_RECIPIENT"),
        );
    }

    debug!(job_id = %job.record.id, template = %data.template, "Sending email");

    let to = data.to.clone();
    let message = EmailMessage {
        to: data.to,
        template: data.template,
        variables: data.variables,
        cc: data.cc.unwrap_or_default(),
        bcc: data.bcc.unwrap_or_default(),
        attachments: data.attachments.unwrap_or_default(),
    };

    let message_id = mailer.send(message).await.map_err(|e| {
        let error = if e.is_retryable() {
            JobError::retryable(e.to_string())
        } else {
            JobError::non_retryable(e.to_string())
        };
        error.with_type("MAILER")
    })?;

    Ok(json!({ "messageId": message_id, "to": to }))
}
