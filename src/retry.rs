//! Bounded exponential backoff for transient sink failures
//!
//! ```text
//! backoff = min(initial_backoff * multiplier^attempt, max_backoff)
//! ```
use std::time::Duration;

use serde::Deserialize;

/// Retry policy configuration for exponential backoff.
///
/// `max_retries` counts retries after the first attempt, so a write is tried
/// at most `max_retries + 1` times before the caller gives up.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: usize,
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let ms = self.initial_backoff.as_millis() as f64 * factor;
        let capped = ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
