//! Per-run context threaded through planning and execution.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ExecutionConfig, RetryConfig};
use crate::state::generate_holder_id;

/// Bounded exponential backoff for retryable provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Total attempts including the first call.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: 1,
        }
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` attempts
    /// have failed. A provider hint longer than the backoff wins, but never
    /// past `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        retry_after.map_or(backoff, |hint| hint.max(backoff).min(self.max_delay))
    }
}

/// Execution settings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Maximum number of steps in flight.
    pub parallelism: usize,
    /// Keep going on independent branches after a failure.
    pub continue_on_error: bool,
    /// Retry policy.
    pub retry: RetryPolicy,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl From<&ExecutionConfig> for ExecutionOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            parallelism: config.parallelism.max(1),
            continue_on_error: config.continue_on_error,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// Identity, options and cancellation for a single run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// Lock holder identity.
    pub holder: String,
    /// Execution settings.
    pub options: ExecutionOptions,
    /// Cancelled when the user interrupts the run.
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Creates a context with a fresh run id and holder id.
    #[must_use]
    pub fn new(options: ExecutionOptions) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            holder: generate_holder_id(),
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses an existing cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns true once the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(ExecutionOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let p = policy();
        let delays: Vec<u64> = (1..=7).map(|n| p.delay_for(n, None).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_retry_after_hint() {
        let p = policy();
        assert_eq!(
            p.delay_for(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        // A shorter hint does not shorten the backoff.
        assert_eq!(
            p.delay_for(4, Some(Duration::from_secs(2))),
            Duration::from_secs(8)
        );
        assert_eq!(
            p.delay_for(1, Some(Duration::from_secs(120))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_defaults_match_config() {
        let options = ExecutionOptions::default();
        assert_eq!(options.parallelism, 1);
        assert!(!options.continue_on_error);
        assert_eq!(options.retry.base_delay, Duration::from_secs(1));
        assert_eq!(options.retry.max_delay, Duration::from_secs(30));
        assert_eq!(options.retry.max_attempts, 5);
    }
}
