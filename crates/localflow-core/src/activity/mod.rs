//! Activity invocation.
//!
//! - `registry` -- named activity handlers with per-attempt timeout and retry
//! - `retry` -- stateless retry decisions and backoff
//!
//! The executor only sees `ActivityInvoker`. Failures are reported as an
//! unsuccessful `ActivityResult`, never as an error.

pub mod registry;
pub mod retry;

use std::time::Duration;

use localflow_types::activity::ActivityResult;

pub use registry::{ActivityHandler, ActivityRegistry, FnActivity};

/// Invokes activities by name on behalf of the executor.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait ActivityInvoker: Send + Sync {
    /// Run `name`, giving each attempt at most `timeout`.
    fn invoke(
        &self,
        name: &str,
        timeout: Duration,
    ) -> impl std::future::Future<Output = ActivityResult> + Send;
}
