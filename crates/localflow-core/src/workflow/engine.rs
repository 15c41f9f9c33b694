//! Event-sourced workflow state machine.
//!
//! `WorkflowEngine` owns every live `WorkflowInstance`. Each instance sits
//! behind its own mutex; the process-wide event log sits behind another.
//! Lock order is always instance first, then log, so appends from different
//! instances interleave in the log in the same order they were appended.
//!
//! Callers only ever receive snapshots. Mutation goes through `record_event`,
//! `update_status` and `advance_cursor`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use localflow_types::workflow::{EventKind, WorkflowEvent, WorkflowInstance, WorkflowStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::timer::clock::Clock;

#[derive(Default)]
struct EventLog {
    events: Vec<WorkflowEvent>,
    next_sequence: u64,
}

/// In-memory instance table plus the global event log.
pub struct WorkflowEngine {
    instances: DashMap<Uuid, Arc<Mutex<WorkflowInstance>>>,
    log: Mutex<EventLog>,
    clock: Arc<dyn Clock>,
}

impl WorkflowEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            instances: DashMap::new(),
            log: Mutex::new(EventLog {
                events: Vec::new(),
                next_sequence: 1,
            }),
            clock,
        }
    }

    fn slot(&self, id: &Uuid) -> Result<Arc<Mutex<WorkflowInstance>>, EngineError> {
        self.instances
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::NotFound(*id))
    }

    fn log(&self) -> std::sync::MutexGuard<'_, EventLog> {
        self.log.lock().expect("event log lock poisoned")
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a pending instance with an empty history.
    pub fn create(&self, name: &str) -> WorkflowInstance {
        let instance = WorkflowInstance::new(name, self.clock.now());
        self.instances
            .insert(instance.id, Arc::new(Mutex::new(instance.clone())));
        tracing::info!(workflow_id = %instance.id, name, "created workflow instance");
        instance
    }

    /// Append an event to an instance's history and the global log.
    ///
    /// Terminal instances accept no further events, whether the terminal
    /// status has been applied yet or only the terminal event is recorded.
    pub fn record_event(
        &self,
        workflow_id: Uuid,
        kind: EventKind,
        step_index: Option<usize>,
        payload: Value,
    ) -> Result<WorkflowEvent, EngineError> {
        let slot = self.slot(&workflow_id)?;
        let mut instance = slot.lock().expect("instance lock poisoned");

        let status = instance.effective_status();
        if status.is_terminal() {
            return Err(EngineError::TerminalStateViolation { workflow_id, status });
        }

        let mut log = self.log();
        let event = WorkflowEvent {
            id: Uuid::now_v7(),
            sequence: log.next_sequence,
            position: instance.events.len(),
            workflow_id,
            timestamp: self.clock.now(),
            kind,
            step_index,
            payload,
        };
        log.next_sequence += 1;
        log.events.push(event.clone());
        instance.events.push(event.clone());

        tracing::debug!(
            workflow_id = %workflow_id,
            kind = %kind,
            sequence = event.sequence,
            "recorded event"
        );
        Ok(event)
    }

    /// Move an instance to `status`.
    ///
    /// Re-applying the current status is a no-op. Leaving a terminal status
    /// fails with `TerminalStateViolation`; moving backwards fails with
    /// `InvalidTransition`.
    pub fn update_status(&self, workflow_id: Uuid, status: WorkflowStatus) -> Result<(), EngineError> {
        let slot = self.slot(&workflow_id)?;
        let mut instance = slot.lock().expect("instance lock poisoned");
        let current = instance.status;

        if current == status {
            return Ok(());
        }
        if current.is_terminal() {
            return Err(EngineError::TerminalStateViolation {
                workflow_id,
                status: current,
            });
        }
        if !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                workflow_id,
                from: current,
                to: status,
            });
        }

        instance.status = status;
        tracing::info!(workflow_id = %workflow_id, from = %current, to = %status, "workflow status changed");
        Ok(())
    }

    /// Snapshot of an instance.
    pub fn get(&self, workflow_id: &Uuid) -> Option<WorkflowInstance> {
        let slot = self.slot(workflow_id).ok()?;
        let instance = slot.lock().expect("instance lock poisoned");
        Some(instance.clone())
    }

    /// Set how many leading events the current execution has reflected.
    pub fn advance_cursor(&self, workflow_id: Uuid, cursor: usize) -> Result<(), EngineError> {
        let slot = self.slot(&workflow_id)?;
        let mut instance = slot.lock().expect("instance lock poisoned");
        let len = instance.events.len();
        if cursor > len {
            return Err(EngineError::CursorOutOfRange {
                workflow_id,
                cursor,
                len,
            });
        }
        instance.replay_cursor = cursor;
        Ok(())
    }

    /// Snapshots of every instance, oldest first.
    pub fn list(&self) -> Vec<WorkflowInstance> {
        let slots: Vec<_> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut instances: Vec<_> = slots
            .iter()
            .map(|slot| slot.lock().expect("instance lock poisoned").clone())
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        instances
    }

    // -----------------------------------------------------------------------
    // Global log
    // -----------------------------------------------------------------------

    /// The process-wide event log in append order.
    pub fn event_log(&self) -> Vec<WorkflowEvent> {
        self.log().events.clone()
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Put a persisted snapshot back into the table after a restart.
    ///
    /// An instance already present in memory is left alone; returns whether
    /// the snapshot was taken. A snapshot whose history ends in a terminal
    /// event is restored with that terminal status.
    pub fn restore(&self, mut instance: WorkflowInstance) -> bool {
        if self.instances.contains_key(&instance.id) {
            return false;
        }
        let status = instance.effective_status();
        if status != instance.status {
            tracing::warn!(
                workflow_id = %instance.id,
                stored = %instance.status,
                derived = %status,
                "stored status lags history, using derived status"
            );
            instance.status = status;
        }
        let max_sequence = instance.events.iter().map(|e| e.sequence).max();
        if let Some(max) = max_sequence {
            let mut log = self.log();
            log.next_sequence = log.next_sequence.max(max + 1);
        }
        tracing::debug!(workflow_id = %instance.id, status = %instance.status, "restored workflow instance");
        self.instances
            .insert(instance.id, Arc::new(Mutex::new(instance)));
        true
    }

    /// Merge a persisted global log into the in-memory one.
    ///
    /// Events are matched by sequence number; the result stays in
    /// sequence order.
    pub fn restore_event_log(&self, events: Vec<WorkflowEvent>) {
        let mut log = self.log();
        let known: HashSet<u64> = log.events.iter().map(|e| e.sequence).collect();
        log.events
            .extend(events.into_iter().filter(|e| !known.contains(&e.sequence)));
        log.events.sort_by_key(|e| e.sequence);

        let max_sequence = log.events.last().map(|e| e.sequence);
        if let Some(max) = max_sequence {
            log.next_sequence = log.next_sequence.max(max + 1);
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow instance not found: {0}")]
    NotFound(Uuid),

    #[error("workflow {workflow_id} is already {status}")]
    TerminalStateViolation {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    #[error("workflow {workflow_id} cannot move from {from} to {to}")]
    InvalidTransition {
        workflow_id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("replay cursor {cursor} is past the end of workflow {workflow_id} history ({len} events)")]
    CursorOutOfRange {
        workflow_id: Uuid,
        cursor: usize,
        len: usize,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
