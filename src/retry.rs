//! Bounded exponential backoff for transient request failures
//!
//! The delay schedule comes from `retry-policies`; the executor sleeps on the
//! tokio clock, so delays are handed out as plain durations.

use std::time::{Duration, SystemTime};

use retry_policies::policies::ExponentialBackoff;
use retry_policies::{Jitter, RetryDecision, RetryPolicy as _};

/// How transient failures are retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor between consecutive delays
    pub factor: u32,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            factor: 2,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Starts the schedule for one request
    pub fn backoff(&self) -> Backoff {
        let schedule = ExponentialBackoff::builder()
            .retry_bounds(self.base_delay.min(self.max_delay), self.max_delay)
            .jitter(Jitter::None)
            .base(self.factor)
            .build_with_max_retries(self.max_attempts.saturating_sub(1));
        Backoff {
            schedule,
            started: SystemTime::now(),
            retries: 0,
        }
    }
}

/// Tracks attempts made for a single request
pub struct Backoff {
    schedule: ExponentialBackoff,
    started: SystemTime,
    retries: u32,
}

impl Backoff {
    /// Number of the attempt currently being made, starting at 1
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        match self.schedule.should_retry(self.started, self.retries) {
            RetryDecision::Retry { execute_after } => {
                self.retries += 1;
                let wait = execute_after.duration_since(SystemTime::now()).unwrap_or_default();
                Some(whole_millis(wait))
            }
            RetryDecision::DoNotRetry => None,
        }
    }
}

/// The schedule is expressed as a wall-clock deadline; the time spent
/// between computing it and reading it back is dropped here.
fn whole_millis(wait: Duration) -> Duration {
    Duration::from_millis(((wait.as_micros() + 500) / 1000) as u64)
}
