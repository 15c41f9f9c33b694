//! Global configuration types for Localflow.
//!
//! `GlobalConfig` represents the top-level `config.toml` that controls the
//! worker pool, activity timeouts and retry, and the timer poll interval.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Localflow engine.
///
/// Loaded from `~/.localflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Maximum number of workflow instances driven concurrently.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Per-attempt activity timeout in seconds.
    #[serde(default = "default_activity_timeout_secs")]
    pub activity_timeout_secs: u64,

    /// Upper bound on how long the runtime sleeps between timer checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Activity retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Directory of executable scripts exposed as activities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activities_dir: Option<PathBuf>,
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_activity_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            activity_timeout_secs: default_activity_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            retry: RetryConfig::default(),
            activities_dir: None,
        }
    }
}

/// Retry configuration for activity invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (default 1, i.e. no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before each retry, multiplied by the attempt number.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_config_default_values() {
        let config = GlobalConfig::default();
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.activity_timeout_secs, 30);
        assert_eq!(config.poll_interval_ms, 1_000);
        assert_eq!(config.retry.max_attempts, 1);
        assert!(config.activities_dir.is_none());
    }

    #[test]
    fn test_global_config_deserialize_with_defaults() {
        let config: GlobalConfig = toml::from_str("").unwrap();
        assert_eq!(config, GlobalConfig::default());
    }

    #[test]
    fn test_global_config_deserialize_with_values() {
        let toml_str = r#"
worker_pool_size = 8
activity_timeout_secs = 5
activities_dir = "/opt/localflow/activities"

[retry]
max_attempts = 3
"#;
        let config: GlobalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.activity_timeout_secs, 5);
        assert_eq!(config.poll_interval_ms, 1_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_ms, 500);
        assert_eq!(
            config.activities_dir,
            Some(PathBuf::from("/opt/localflow/activities"))
        );
    }
}
