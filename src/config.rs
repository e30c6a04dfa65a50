//! Cache configuration

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Address of the local backup service
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:42038";

/// Configuration for the resource cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Scheme, host and port of the backup service
    pub base_url: String,
    /// Interval for re-fetching job ids and job details while subscribed
    pub poll_interval: Duration,
    /// How long an unsubscribed subscription lingers before it is dropped
    pub grace_period: Duration,
    /// How long unreferenced entities are kept in the store
    pub retention: Duration,
    /// Per-call transport timeout
    pub request_timeout: Duration,
    /// Retry policy for transient failures
    pub retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: Duration::from_millis(5000),
            grace_period: Duration::from_millis(1000),
            retention: Duration::from_secs(300), // 5 minutes
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}
