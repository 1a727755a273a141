//! Retry configuration: accepted from config and per client, never executed
//! by the toolkit itself.
//!
//! Uses `backon` so callers that do want to retry a scenario step can build
//! an exponential backoff with the configured bounds.

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

use crate::error::ErrorKind;

/// Retry bounds for a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,
    /// Delay before the first retry, in milliseconds.
    pub min_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Randomise delays to avoid synchronised retries.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay_ms: 50,
            max_delay_ms: 2_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with these bounds.
    ///
    /// - Min delay: `min_delay_ms`
    /// - Max delay: `max_delay_ms`
    /// - Max attempts: `max_retries`
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_retries);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Determines if a canonical error kind is worth retrying.
///
/// Retryable kinds:
/// - `deadlock`, `serialization-conflict`: the backend aborted this participant
/// - `unavailable`, `resource-exhausted`: transient capacity problems
///
/// Timeouts and cancellations are the caller's own decision and never retried.
pub fn is_retryable(kind: ErrorKind) -> bool {
    kind.is_transient()
}
