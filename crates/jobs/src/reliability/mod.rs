//! Reliability patterns for job processing
//!
//! This module provides:
//! - [`BackoffSpec`] - Exponential or fixed delay between failed attempts

mod retry;

pub use retry::{BackoffKind, BackoffSpec};
