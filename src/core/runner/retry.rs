//! Retry policy for provider calls.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::core::llm::ProviderError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub fallback_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            fallback_delay: Duration::from_secs(config.fallback_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }
}

/// The provider's hint capped at `max_delay`, else the fallback.
pub fn compute_delay(policy: &RetryPolicy, error: &ProviderError) -> Duration {
    match error.retry_after() {
        Some(hint) => hint.min(policy.max_delay),
        None => policy.fallback_delay,
    }
}

/// `attempt` is 1-based: the number of attempts already made.
pub fn should_retry(policy: &RetryPolicy, error: &ProviderError, attempt: u32) -> bool {
    error.is_transient() && attempt < policy.max_attempts
}
