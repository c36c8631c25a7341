//! Fixed-delay bounded retry
//!
//! Shared by the broker session (reconnect attempts) and the write buffer
//! (flush retries). Delays are slept on tokio's timer, so tests drive them
//! with paused time instead of wall clock.

use std::time::Duration;

/// How many times to retry and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Wait before each retry
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Fresh attempt counter for one operation
    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            failures: 0,
        }
    }
}

/// Attempt counter for one retried operation
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryState {
    /// Record a failed attempt.
    ///
    /// Returns the delay to wait before retrying, or `None` once the
    /// retries are exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.policy.max_retries {
            None
        } else {
            Some(self.policy.delay)
        }
    }

    /// Failed attempts so far
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_retries_means_four_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.max_attempts(), 4);

        let mut state = policy.start();
        assert_eq!(state.record_failure(), Some(Duration::from_secs(1)));
        assert_eq!(state.record_failure(), Some(Duration::from_secs(1)));
        assert_eq!(state.record_failure(), Some(Duration::from_secs(1)));
        assert_eq!(state.record_failure(), None);
        assert_eq!(state.failures(), 4);
    }

    #[test]
    fn test_zero_retries() {
        let mut state = RetryPolicy::new(0, Duration::from_millis(10)).start();
        assert_eq!(state.record_failure(), None);
    }
}
