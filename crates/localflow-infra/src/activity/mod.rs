//! Activity handlers backed by host resources.
//!
//! - `process` -- activities implemented as executable scripts

pub mod process;

pub use process::{ProcessActivity, discover_activities, register_process_activities};
