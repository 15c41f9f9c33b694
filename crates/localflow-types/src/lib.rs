//! Shared domain types for Localflow.
//!
//! This crate contains the types every other Localflow crate speaks:
//! workflow instances and their event history, step plans, timers,
//! activity results, configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod activity;
pub mod config;
pub mod error;
pub mod timer;
pub mod workflow;
