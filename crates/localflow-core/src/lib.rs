//! Workflow engine core for Localflow.
//!
//! This crate holds the event-sourced workflow state machine, the
//! deterministic executor, the durable timer scheduler and the repository
//! trait (`WorkflowStore`) that the infrastructure layer implements. It
//! depends only on `localflow-types`, never on `localflow-infra` or any
//! database/IO crate.

pub mod activity;
pub mod repository;
pub mod timer;
pub mod workflow;
