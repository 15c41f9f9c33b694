//! Named activity handlers.
//!
//! `ActivityRegistry` maps activity names to handlers and implements
//! `ActivityInvoker` on top of them: per-attempt timeout, retry with
//! backoff, and total elapsed time across attempts.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use localflow_types::activity::ActivityResult;
use localflow_types::config::RetryConfig;

use super::ActivityInvoker;
use super::retry::{RetryHandler, UNKNOWN_ACTIVITY_PREFIX};

/// Object-safe activity body.
///
/// `Ok` carries the activity output, `Err` the failure message.
pub trait ActivityHandler: Send + Sync {
    fn call<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// FnActivity
// ---------------------------------------------------------------------------

/// A synchronous closure run on the blocking thread pool.
///
/// A timed-out closure keeps its blocking thread until it returns; only its
/// result is discarded.
pub struct FnActivity<F> {
    func: Arc<F>,
}

impl<F> FnActivity<F>
where
    F: Fn() -> Result<String, String> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

impl<F> ActivityHandler for FnActivity<F>
where
    F: Fn() -> Result<String, String> + Send + Sync + 'static,
{
    fn call<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
        let func = Arc::clone(&self.func);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || func())
                .await
                .map_err(|e| format!("activity '{name}' panicked: {e}"))?
        })
    }
}

// ---------------------------------------------------------------------------
// ActivityRegistry
// ---------------------------------------------------------------------------

/// Activity handlers keyed by name, plus the retry policy applied to all.
#[derive(Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
    retry: RetryConfig,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(retry: RetryConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            retry,
        }
    }

    /// Register (or replace) the handler for `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: impl ActivityHandler + 'static) -> &mut Self {
        let name = name.into();
        tracing::debug!(activity = %name, "registered activity");
        self.handlers.insert(name, Arc::new(handler));
        self
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn() -> Result<String, String> + Send + Sync + 'static,
    {
        self.register(name, FnActivity::new(func))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ActivityInvoker for ActivityRegistry {
    async fn invoke(&self, name: &str, timeout: Duration) -> ActivityResult {
        let started = Instant::now();
        let Some(handler) = self.handlers.get(name).cloned() else {
            tracing::warn!(activity = name, "invoked unregistered activity");
            return ActivityResult::failure(
                format!("{UNKNOWN_ACTIVITY_PREFIX} '{name}'"),
                started.elapsed(),
            );
        };

        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(timeout, handler.call(name)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(format!("activity '{name}' timed out after {timeout:?}")),
            };

            match outcome {
                Ok(output) => {
                    tracing::debug!(activity = name, attempt, "activity succeeded");
                    return ActivityResult::success(output, started.elapsed()).with_attempts(attempt);
                }
                Err(error) if RetryHandler::should_retry(&self.retry, attempt, &error) => {
                    tracing::warn!(activity = name, attempt, error = %error, "activity failed, retrying");
                    tokio::time::sleep(RetryHandler::backoff(&self.retry, attempt)).await;
                    attempt += 1;
                }
                Err(error) => {
                    tracing::warn!(activity = name, attempt, error = %error, "activity failed");
                    return ActivityResult::failure(error, started.elapsed()).with_attempts(attempt);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn registered_activity_succeeds() {
        let mut registry = ActivityRegistry::new();
        registry.register_fn("charge_card", || Ok("charged".to_string()));

        let result = registry.invoke("charge_card", TIMEOUT).await;
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("charged"));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn unknown_activity_is_a_failure_value() {
        let registry = ActivityRegistry::new();
        let result = registry.invoke("nope", TIMEOUT).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn failing_activity_reports_error() {
        let mut registry = ActivityRegistry::new();
        registry.register_fn("send_email", || Err("smtp down".to_string()));

        let result = registry.invoke("send_email", TIMEOUT).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("smtp down"));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = ActivityRegistry::with_retry(RetryConfig {
            max_attempts: 3,
            backoff_ms: 1,
        });
        registry.register_fn("flaky", move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("transient".to_string())
            } else {
                Ok("done".to_string())
            }
        });

        let result = registry.invoke("flaky", TIMEOUT).await;
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let mut registry = ActivityRegistry::with_retry(RetryConfig {
            max_attempts: 2,
            backoff_ms: 1,
        });
        registry.register_fn("broken", || Err("still broken".to_string()));

        let result = registry.invoke("broken", TIMEOUT).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 2);
    }

    struct Sleepy;

    impl ActivityHandler for Sleepy {
        fn call<'a>(
            &'a self,
            _name: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("too late".to_string())
            })
        }
    }

    #[tokio::test]
    async fn slow_activity_times_out() {
        let mut registry = ActivityRegistry::new();
        registry.register("sleepy", Sleepy);

        let result = registry.invoke("sleepy", Duration::from_millis(20)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = ActivityRegistry::new();
        registry
            .register_fn("update_crm", || Ok(String::new()))
            .register_fn("charge_card", || Ok(String::new()));
        assert_eq!(registry.names(), vec!["charge_card", "update_crm"]);
        assert!(registry.contains("charge_card"));
    }
}
