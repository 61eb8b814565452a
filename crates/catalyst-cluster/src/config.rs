//! Cluster synchronization configuration.

use std::time::Duration;

/// Retry policy for content downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts (tests, local).
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
        }
    }
}

/// Configuration for a [`ClusterSynchronizer`](crate::ClusterSynchronizer).
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Safety margin subtracted from a peer's current time before it is
    /// treated as immutable.
    pub request_ttl_backwards: Duration,

    /// Timeout applied to every outbound peer request.
    pub request_timeout: Duration,

    /// Retry policy for `/contents/{hash}` downloads.
    pub content_retry: RetryPolicy,

    /// Page size requested from peers' `/deployments`.
    pub history_page_limit: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            request_ttl_backwards: Duration::from_secs(20 * 60),
            request_timeout: Duration::from_secs(60),
            content_retry: RetryPolicy::default(),
            history_page_limit: catalyst_history::MAX_HISTORY_LIMIT,
        }
    }
}

impl ClusterConfig {
    #[must_use]
    pub fn with_request_ttl_backwards(mut self, ttl: Duration) -> Self {
        self.request_ttl_backwards = ttl;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_content_retry(mut self, retry: RetryPolicy) -> Self {
        self.content_retry = retry;
        self
    }

    #[must_use]
    pub fn with_history_page_limit(mut self, limit: usize) -> Self {
        self.history_page_limit = catalyst_history::clamp_limit(Some(limit));
        self
    }

    /// `request_ttl_backwards` in milliseconds.
    pub fn request_ttl_backwards_millis(&self) -> u64 {
        self.request_ttl_backwards.as_millis() as u64
    }
}
