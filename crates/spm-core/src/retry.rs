//! Bounded retry policy for transient controller failures.

use std::time::Duration;

/// Defines how often a failed step is retried and how long to wait in between.
///
/// `max_retries` counts retries, not attempts: a policy with `max_retries = 2`
/// sends a step at most three times (the initial attempt plus two retries).
/// The delay is constant; there is no exponential backoff.
///
/// # Example
///
/// ```rust
/// use spm_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(2, Duration::from_millis(50));
/// assert!(policy.allows_retry(0));
/// assert!(policy.allows_retry(1));
/// assert!(!policy.allows_retry(2));
/// assert_eq!(policy.max_attempts(), 3);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt. Zero disables retries.
    pub max_retries: u32,
    /// Delay before each retry.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    /// Two retries with 100ms between attempts.
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given retry bound and delay.
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn allows_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Total number of sends a single step may take.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
