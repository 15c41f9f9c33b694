//! Workflow engine core: event log, replaying executor and durable checkpointing.
//!
//! - `engine` -- instance registry, event log and status transitions
//! - `replay` -- per-step index over an instance's recorded history
//! - `executor` -- deterministic step interpreter with suspend/resume on waits
//! - `checkpoint` -- persistence of instances, event log and timers
//! - `definition` -- `.flow` DSL parsing, validation and discovery
//! - `runtime` -- plan registry, worker pool, timer polling and recovery

pub mod checkpoint;
pub mod definition;
pub mod engine;
pub mod executor;
pub mod replay;
pub mod runtime;
