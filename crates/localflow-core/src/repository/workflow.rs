//! Workflow store trait definition.
//!
//! Defines the durable storage interface for workflow instances, the global
//! event log, pending timers, and compiled definitions. The infrastructure
//! layer (localflow-infra) implements this trait with SQLite persistence;
//! `memory::InMemoryWorkflowStore` backs tests and ephemeral runs.

use std::sync::Arc;

use localflow_types::error::RepositoryError;
use localflow_types::timer::Timer;
use localflow_types::workflow::{WorkflowDefinition, WorkflowEvent, WorkflowInstance};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers four entity families:
/// - **Instances:** full snapshots, history and replay cursor included.
/// - **Event log:** the process-wide interleaved audit log.
/// - **Timers:** outstanding waits, reloaded into the scheduler on restart.
/// - **Definitions:** compiled plans, looked up by workflow name.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Upsert an instance snapshot. Loading it back must yield an equal value.
    fn save_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load an instance. Unknown IDs fail with `RepositoryError::NotFound`.
    fn load_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<WorkflowInstance, RepositoryError>> + Send;

    /// All persisted instances, oldest first.
    fn list_instances(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Global event log
    // -----------------------------------------------------------------------

    /// Persist the global event log. Events already stored are kept as is.
    fn save_event_log(
        &self,
        events: &[WorkflowEvent],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load the global event log in sequence order. Empty if never saved.
    fn load_event_log(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowEvent>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Persist an outstanding timer (upsert by ID).
    fn save_timer(
        &self,
        timer: &Timer,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Forget a timer. Returns `true` if it existed.
    fn delete_timer(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// All outstanding timers ordered by fire time, then creation.
    fn load_timers(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Timer>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a compiled definition by name.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a definition by workflow name.
    fn get_definition(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// All definitions, sorted by name.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;
}

/// Shared stores: lets the runtime, the CLI and tests hold one store
/// through several owners.
impl<T: WorkflowStore> WorkflowStore for Arc<T> {
    fn save_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).save_instance(instance)
    }

    fn load_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<WorkflowInstance, RepositoryError>> + Send {
        (**self).load_instance(id)
    }

    fn list_instances(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send {
        (**self).list_instances()
    }

    fn save_event_log(
        &self,
        events: &[WorkflowEvent],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).save_event_log(events)
    }

    fn load_event_log(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowEvent>, RepositoryError>> + Send {
        (**self).load_event_log()
    }

    fn save_timer(
        &self,
        timer: &Timer,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).save_timer(timer)
    }

    fn delete_timer(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send {
        (**self).delete_timer(id)
    }

    fn load_timers(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Timer>, RepositoryError>> + Send {
        (**self).load_timers()
    }

    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).save_definition(def)
    }

    fn get_definition(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send {
        (**self).get_definition(name)
    }

    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send {
        (**self).list_definitions()
    }
}
