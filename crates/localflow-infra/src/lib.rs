//! Infrastructure layer for Localflow.
//!
//! Contains the implementations behind the ports defined in `localflow-core`:
//! SQLite workflow storage, script-backed activities, configuration loading
//! and the on-disk data directory layout.

pub mod activity;
pub mod config;
pub mod filesystem;
pub mod sqlite;
