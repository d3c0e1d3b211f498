//! Scaffold for a new job module
//!
//! Copy this file to `src/jobs/<name>_job.rs`. build.rs picks up every
//! `*_job.rs` file except this one and calls its `register` at startup.

use anyhow::Context;
use atcdrill_jobs::{JobPayload, JobResult, QueueDefinition, QueueRegistry, TypedJob};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::JobContext;

pub const CONCURRENCY: usize = 1;

/// Payload of a `template` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateJobData {
    pub message: String,
}

impl JobPayload for TemplateJobData {
    const QUEUE: &'static str = "template";
}

pub fn register(registry: &mut QueueRegistry, ctx: &JobContext) -> anyhow::Result<()> {
    let definition = QueueDefinition::for_payload::<TemplateJobData, _, _>(process)
        .with_worker_options(ctx.worker_options(CONCURRENCY));

    registry
        .register(definition)
        .context("failed to register template queue")?;
    Ok(())
}

async fn process(job: TypedJob<TemplateJobData>) -> JobResult {
    Ok(json!({ "echo": job.data.payload.message }))
}
