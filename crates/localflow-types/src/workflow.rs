//! Workflow domain types for Localflow.
//!
//! A workflow instance is event-sourced: its `events` are the durable truth
//! and `status` is a cached fold over them. Step plans (`Step`) are the
//! compiled form of a workflow definition and are never persisted inside an
//! instance; replay pairs an instance's history with the plan registered under
//! its name.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
///
/// Transitions are monotonic: `Pending -> Running -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Completed and Failed admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects the lifecycle order.
    ///
    /// Re-applying the current status is always allowed (it is a no-op).
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            // Failed directly from Pending is a cancellation before the first run.
            Self::Pending => matches!(next, Self::Running | Self::Failed),
            Self::Running => next != Self::Pending,
            Self::Completed | Self::Failed => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// The fact an event records.
///
/// Serialized in PascalCase so persisted histories read the same as the
/// names used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    WorkflowStarted,
    ActivityCompleted,
    ActivityFailed,
    TimerScheduled,
    TimerFired,
    WorkflowCompleted,
    WorkflowFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStarted => "WorkflowStarted",
            Self::ActivityCompleted => "ActivityCompleted",
            Self::ActivityFailed => "ActivityFailed",
            Self::TimerScheduled => "TimerScheduled",
            Self::TimerFired => "TimerFired",
            Self::WorkflowCompleted => "WorkflowCompleted",
            Self::WorkflowFailed => "WorkflowFailed",
        }
    }

    /// Events that belong to an activity step.
    pub fn is_activity_event(self) -> bool {
        matches!(self, Self::ActivityCompleted | Self::ActivityFailed)
    }

    /// Events that belong to a wait step.
    pub fn is_timer_event(self) -> bool {
        matches!(self, Self::TimerScheduled | Self::TimerFired)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WorkflowStarted" => Ok(Self::WorkflowStarted),
            "ActivityCompleted" => Ok(Self::ActivityCompleted),
            "ActivityFailed" => Ok(Self::ActivityFailed),
            "TimerScheduled" => Ok(Self::TimerScheduled),
            "TimerFired" => Ok(Self::TimerFired),
            "WorkflowCompleted" => Ok(Self::WorkflowCompleted),
            "WorkflowFailed" => Ok(Self::WorkflowFailed),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// One immutable fact in a workflow's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// UUIDv7 event ID.
    pub id: Uuid,
    /// Process-wide append order, shared by all instances.
    pub sequence: u64,
    /// Index of this event within its instance's history.
    pub position: usize,
    /// Owning workflow instance.
    pub workflow_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Plan position of the step this event belongs to.
    /// `None` for workflow-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Workflow Instance
// ---------------------------------------------------------------------------

/// One execution of a named workflow plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance ID.
    pub id: Uuid,
    /// Workflow type name; selects the step plan on replay.
    pub name: String,
    pub status: WorkflowStatus,
    /// Ordered, append-only history.
    #[serde(default)]
    pub events: Vec<WorkflowEvent>,
    /// Number of leading events already reflected in the current
    /// execution position. Never exceeds `events.len()`.
    #[serde(default)]
    pub replay_cursor: usize,
    pub created_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// A fresh, pending instance with an empty history.
    pub fn new(name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            status: WorkflowStatus::Pending,
            events: Vec::new(),
            replay_cursor: 0,
            created_at,
        }
    }

    /// Status implied by the event history alone.
    pub fn derived_status(&self) -> WorkflowStatus {
        match self.events.last().map(|e| e.kind) {
            None => WorkflowStatus::Pending,
            Some(EventKind::WorkflowCompleted) => WorkflowStatus::Completed,
            Some(EventKind::WorkflowFailed) => WorkflowStatus::Failed,
            Some(_) => WorkflowStatus::Running,
        }
    }

    /// The stored status, unless the history already ends in a terminal
    /// event, in which case that event wins.
    pub fn effective_status(&self) -> WorkflowStatus {
        match self.derived_status() {
            derived if derived.is_terminal() => derived,
            _ => self.status,
        }
    }

    pub fn last_event(&self) -> Option<&WorkflowEvent> {
        self.events.last()
    }

    /// Events recorded for the step at `index`, in append order.
    pub fn events_for_step(&self, index: usize) -> impl Iterator<Item = &WorkflowEvent> {
        self.events
            .iter()
            .filter(move |e| e.step_index == Some(index))
    }

    /// Error message carried by the last `WorkflowFailed` event, if any.
    pub fn failure_reason(&self) -> Option<String> {
        self.events
            .iter()
            .rev()
            .find(|e| e.kind == EventKind::WorkflowFailed)
            .and_then(|e| e.payload.get("error"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

// ---------------------------------------------------------------------------
// Step Plan
// ---------------------------------------------------------------------------

/// One unit of a workflow's plan.
///
/// Steps are identified by their position in the plan together with their
/// kind; activity names need not be unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Invoke a named activity.
    Activity { name: String },
    /// Suspend until a durable timer fires. Signed so that negative
    /// durations reach the scheduler and get rejected there.
    Wait { seconds: i64 },
}

impl Step {
    pub fn activity(name: impl Into<String>) -> Self {
        Self::Activity { name: name.into() }
    }

    pub fn wait(seconds: i64) -> Self {
        Self::Wait { seconds }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Activity { .. } => "activity",
            Self::Wait { .. } => "wait",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activity { name } => write!(f, "step {name}"),
            Self::Wait { seconds } => write!(f, "wait {seconds}s"),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A compiled workflow definition: a name bound to an ordered step plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<Step>,
    /// Source text the plan was compiled from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub registered_at: DateTime<Utc>,
}
