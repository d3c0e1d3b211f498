//! Workers for job execution
//!
//! This module provides:
//! - [`Worker`] - runs a queue's processor over claimed jobs, at most
//!   `concurrency` at a time
//! - [`JobPoller`] - job claiming with exponential backoff
//! - [`WorkerEvent`] - completion, failure and error notifications
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │  ┌─────────────┐                                            │
//! │  │  JobPoller  │  claim ≤ free slots, back off when idle     │
//! │  └──────┬──────┘                                            │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │          Job Executor (Semaphore-limited)            │    │
//! │  │  [Job 1] [Job 2] [Job 3] ... [Job N]                 │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │         │ complete / fail (attempts, backoff, retention)     │
//! │         ▼                                                    │
//! │      JobStore  ───►  WorkerEvent broadcast + tracing         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Job lifecycle
//!
//! `Waiting -> Active -> Completed`, or on a processor error
//! `Active -> Delayed -> Waiting` while attempts remain and
//! `Active -> Failed` once they are used up. Every failed attempt is logged.

mod poller;
mod pool;

pub use poller::{JobPoller, PollerConfig};
pub use pool::{Worker, WorkerError, WorkerEvent, WorkerOptions, WorkerStatus};
