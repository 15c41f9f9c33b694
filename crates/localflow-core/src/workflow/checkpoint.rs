//! Durable checkpoint manager for workflow execution state.
//!
//! Wraps `WorkflowStore` to provide the higher-level API the executor and
//! runtime use. Every appended event is followed by an instance snapshot,
//! and every timer the executor registers is persisted before the workflow
//! suspends, so a crashed process resumes from the last recorded event.

use localflow_types::error::RepositoryError;
use localflow_types::timer::Timer;
use localflow_types::workflow::{WorkflowDefinition, WorkflowEvent, WorkflowInstance};
use uuid::Uuid;

use crate::repository::workflow::WorkflowStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for workflow instances.
///
/// Generic over `R: WorkflowStore` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<R: WorkflowStore> {
    repo: R,
}

impl<R: WorkflowStore> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given store.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying store.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Instance checkpoints
    // -----------------------------------------------------------------------

    /// Persist a full instance snapshot.
    pub async fn checkpoint_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(), CheckpointError> {
        self.repo
            .save_instance(instance)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            workflow_id = %instance.id,
            status = %instance.status,
            events = instance.events.len(),
            cursor = instance.replay_cursor,
            "checkpointed instance"
        );
        Ok(())
    }

    /// Persist the global event log.
    pub async fn checkpoint_event_log(&self, events: &[WorkflowEvent]) -> Result<(), CheckpointError> {
        self.repo
            .save_event_log(events)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(events = events.len(), "checkpointed event log");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timer checkpoints
    // -----------------------------------------------------------------------

    /// Persist a freshly scheduled timer.
    pub async fn checkpoint_timer_scheduled(&self, timer: &Timer) -> Result<(), CheckpointError> {
        self.repo
            .save_timer(timer)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            timer_id = %timer.id,
            workflow_id = %timer.workflow_id,
            fire_at = %timer.fire_at,
            "checkpointed timer"
        );
        Ok(())
    }

    /// Forget a timer that fired or was cancelled.
    pub async fn checkpoint_timer_cleared(&self, timer_id: Uuid) -> Result<(), CheckpointError> {
        let existed = self
            .repo
            .delete_timer(&timer_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(timer_id = %timer_id, existed, "cleared timer checkpoint");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    pub async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), CheckpointError> {
        self.repo
            .save_definition(def)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn definitions(&self) -> Result<Vec<WorkflowDefinition>, CheckpointError> {
        self.repo
            .list_definitions()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Recovery helpers
    // -----------------------------------------------------------------------

    /// Load one instance snapshot.
    pub async fn restore_instance(&self, id: Uuid) -> Result<WorkflowInstance, CheckpointError> {
        self.repo.load_instance(&id).await.map_err(|e| match e {
            RepositoryError::NotFound => CheckpointError::InstanceNotFound(id),
            other => CheckpointError::Repository(other.to_string()),
        })
    }

    /// Load every persisted instance.
    pub async fn restore_instances(&self) -> Result<Vec<WorkflowInstance>, CheckpointError> {
        self.repo
            .list_instances()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Load every outstanding timer.
    pub async fn restore_timers(&self) -> Result<Vec<Timer>, CheckpointError> {
        self.repo
            .load_timers()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Load the persisted global event log.
    pub async fn restore_event_log(&self) -> Result<Vec<WorkflowEvent>, CheckpointError> {
        self.repo
            .load_event_log()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// Workflow instance not found (for restore operations).
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
