//! Backoff policy for failed job attempts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serde_millis::duration_millis;

/// Largest exponent applied by exponential backoff (keeps delays finite).
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Shape of the delay curve between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `delay * 2^(attempts_made - 1)`
    Exponential,
    /// Always `delay`
    Fixed,
}

/// Delay policy applied before a failed job is retried
///
/// # Example
///
/// ```
/// use atcdrill_jobs::BackoffSpec;
/// use std::time::Duration;
///
/// let backoff = BackoffSpec::exponential(Duration::from_secs(2));
///
/// assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
/// assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(4));
/// assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffSpec {
    /// Curve shape
    #[serde(rename = "type")]
    pub kind: BackoffKind,

    /// Base delay
    #[serde(with = "duration_millis")]
    pub delay: Duration,

    /// Jitter factor (0.0-1.0)
    ///
    /// A value of 0.1 means ±10% randomness. Zero keeps delays exact.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for BackoffSpec {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(2))
    }
}

impl BackoffSpec {
    /// Exponential backoff starting at `delay`
    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
            jitter: 0.0,
        }
    }

    /// Constant delay between attempts
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
            jitter: 0.0,
        }
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, given how many attempts have failed so far
    ///
    /// `attempts_made` is 1 after the first failure. Zero means nothing failed
    /// yet and yields no delay.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        let base = match self.kind {
            BackoffKind::Fixed => self.delay.as_secs_f64(),
            BackoffKind::Exponential => {
                let exponent = (attempts_made - 1).min(MAX_BACKOFF_EXPONENT);
                self.delay.as_secs_f64() * 2f64.powi(exponent as i32)
            }
        };

        let jittered = if self.jitter > 0.0 && base > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = base * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (base + jitter_offset).max(0.0)
        } else {
            base
        };

        Duration::from_secs_f64(jittered)
    }
}
