//! Job definitions
//!
//! Every `src/jobs/*_job.rs` file is a job module. The build script collects
//! them into [`discovered_modules`]; a module takes part by exposing
//!
//! ```ignore
//! pub fn register(registry: &mut QueueRegistry, ctx: &JobContext) -> anyhow::Result<()>
//! ```
//!
//! Modules are loaded one at a time in file name order and must not depend on
//! that order. A module that fails to register is logged and skipped.

use std::sync::Arc;
use std::time::Duration;

use atcdrill_jobs::{JobModule, WorkerOptions};

use crate::config::WorkerConfig;
use crate::mailer::Mailer;

/// Services shared with job modules at registration time
#[derive(Clone)]
pub struct JobContext {
    pub mailer: Arc<dyn Mailer>,
    pub shutdown_timeout: Duration,
    pub concurrency_override: Option<usize>,
}

impl JobContext {
    pub fn new(mailer: Arc<dyn Mailer>, config: &WorkerConfig) -> Self {
        Self {
            mailer,
            shutdown_timeout: config.shutdown_timeout,
            concurrency_override: config.concurrency_override,
        }
    }

    /// Worker options for a queue that wants `concurrency` slots
    pub fn worker_options(&self, concurrency: usize) -> WorkerOptions {
        WorkerOptions::new()
            .with_concurrency(self.concurrency_override.unwrap_or(concurrency))
            .with_shutdown_timeout(self.shutdown_timeout)
    }
}

include!(concat!(env!("OUT_DIR"), "/job_manifest.rs"));
