//! Retry handler for activity invocations.
//!
//! Stateless: all decisions take the `RetryConfig` as a parameter. Retry is
//! the invoker's concern; the executor sees only the final outcome.

use std::time::Duration;

use localflow_types::config::RetryConfig;

/// Stateless retry policy for activity failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Determine whether a retry should be attempted.
    ///
    /// Returns `true` if `attempt` is less than `config.max_attempts`.
    /// `attempt` is 1-based (first execution is attempt 1). Unknown
    /// activities are never retried.
    pub fn should_retry(config: &RetryConfig, attempt: u32, error: &str) -> bool {
        if error.starts_with(UNKNOWN_ACTIVITY_PREFIX) {
            return false;
        }
        attempt < config.max_attempts
    }

    /// Delay before the attempt following `attempt`: linear backoff.
    pub fn backoff(config: &RetryConfig, attempt: u32) -> Duration {
        Duration::from_millis(config.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

pub(crate) const UNKNOWN_ACTIVITY_PREFIX: &str = "unknown activity";

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff_ms: 100,
        }
    }

    #[test]
    fn should_retry_within_limit() {
        let cfg = config(3);
        assert!(RetryHandler::should_retry(&cfg, 1, "boom"));
        assert!(RetryHandler::should_retry(&cfg, 2, "boom"));
        assert!(!RetryHandler::should_retry(&cfg, 3, "boom"));
    }

    #[test]
    fn single_attempt_never_retries() {
        assert!(!RetryHandler::should_retry(&config(1), 1, "boom"));
    }

    #[test]
    fn unknown_activity_is_not_retried() {
        assert!(!RetryHandler::should_retry(
            &config(5),
            1,
            "unknown activity 'nope'"
        ));
    }

    #[test]
    fn backoff_grows_linearly() {
        let cfg = config(3);
        assert_eq!(RetryHandler::backoff(&cfg, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::backoff(&cfg, 2), Duration::from_millis(200));
    }
}
