//! Replay index over a workflow's history.
//!
//! `StepHistory` groups an instance's step-scoped events by plan position
//! and checks them against the plan the executor is about to walk. A
//! history that could not have been produced by this plan (different step
//! kind or activity name at a position, or events for positions the plan
//! does not have) is rejected as non-deterministic rather than guessed at.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use localflow_types::timer::Timer;
use localflow_types::workflow::{EventKind, Step, WorkflowEvent, WorkflowInstance};
use uuid::Uuid;

use super::executor::ExecutorError;

/// What the history says about one activity step.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityRecord {
    Completed { position: usize },
    Failed { position: usize, error: String },
}

/// What the history says about one wait step.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitRecord {
    /// The timer registered for this step, rebuilt from `TimerScheduled`.
    pub timer: Timer,
    pub scheduled_position: usize,
    /// Position of the `TimerFired` event, once the wait is over.
    pub fired_position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepRecord {
    Activity(ActivityRecord),
    Wait(WaitRecord),
}

impl StepRecord {
    /// Position just past the last event recorded for this step.
    pub fn end_position(&self) -> usize {
        match self {
            Self::Activity(ActivityRecord::Completed { position })
            | Self::Activity(ActivityRecord::Failed { position, .. }) => position + 1,
            Self::Wait(wait) => wait.fired_position.unwrap_or(wait.scheduled_position) + 1,
        }
    }
}

/// Step-scoped history of one instance, keyed by plan position.
#[derive(Debug, Default)]
pub struct StepHistory {
    steps: BTreeMap<usize, StepRecord>,
    started_position: Option<usize>,
}

impl StepHistory {
    /// Index `instance`'s history and verify it against `plan`.
    pub fn build(instance: &WorkflowInstance, plan: &[Step]) -> Result<Self, ExecutorError> {
        let mut history = StepHistory::default();

        for event in &instance.events {
            let Some(index) = event.step_index else {
                if event.kind == EventKind::WorkflowStarted && history.started_position.is_none() {
                    history.started_position = Some(event.position);
                }
                continue;
            };

            let step = plan.get(index).ok_or_else(|| ExecutorError::NonDeterminism {
                workflow_id: instance.id,
                step_index: index,
                expected: "end of plan".to_string(),
                found: event.kind.to_string(),
            })?;
            history.apply(instance.id, index, step, event)?;
        }
        Ok(history)
    }

    fn apply(
        &mut self,
        workflow_id: Uuid,
        index: usize,
        step: &Step,
        event: &WorkflowEvent,
    ) -> Result<(), ExecutorError> {
        let mismatch = |expected: String| ExecutorError::NonDeterminism {
            workflow_id,
            step_index: index,
            expected,
            found: event.kind.to_string(),
        };

        match step {
            Step::Activity { name } => {
                if !event.kind.is_activity_event() {
                    return Err(mismatch(format!("activity '{name}'")));
                }
                let recorded = payload_str(event, "activity")?;
                if recorded != name {
                    return Err(ExecutorError::NonDeterminism {
                        workflow_id,
                        step_index: index,
                        expected: format!("activity '{name}'"),
                        found: format!("activity '{recorded}'"),
                    });
                }
                let record = if event.kind == EventKind::ActivityCompleted {
                    ActivityRecord::Completed {
                        position: event.position,
                    }
                } else {
                    ActivityRecord::Failed {
                        position: event.position,
                        error: event
                            .payload
                            .get("error")
                            .and_then(|v| v.as_str())
                            .unwrap_or("activity failed")
                            .to_string(),
                    }
                };
                self.steps.insert(index, StepRecord::Activity(record));
            }
            Step::Wait { .. } => {
                if !event.kind.is_timer_event() {
                    return Err(mismatch("wait".to_string()));
                }
                if event.kind == EventKind::TimerScheduled {
                    let timer = Timer {
                        id: payload_uuid(event, "timer_id")?,
                        workflow_id,
                        fire_at: payload_datetime(event, "fire_at")?,
                        duration_secs: payload_i64(event, "duration")?,
                        created_at: event.timestamp,
                    };
                    self.steps.insert(
                        index,
                        StepRecord::Wait(WaitRecord {
                            timer,
                            scheduled_position: event.position,
                            fired_position: None,
                        }),
                    );
                } else {
                    match self.steps.get_mut(&index) {
                        Some(StepRecord::Wait(wait)) => wait.fired_position = Some(event.position),
                        _ => {
                            return Err(ExecutorError::CorruptHistory(format!(
                                "workflow {workflow_id}: TimerFired for step {index} without TimerScheduled"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, index: usize) -> Option<&StepRecord> {
        self.steps.get(&index)
    }

    /// Position of the `WorkflowStarted` event, if recorded.
    pub fn started_position(&self) -> Option<usize> {
        self.started_position
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

fn payload_str<'a>(event: &'a WorkflowEvent, key: &str) -> Result<&'a str, ExecutorError> {
    event
        .payload
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| corrupt(event, key))
}

fn payload_i64(event: &WorkflowEvent, key: &str) -> Result<i64, ExecutorError> {
    event
        .payload
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| corrupt(event, key))
}

fn payload_uuid(event: &WorkflowEvent, key: &str) -> Result<Uuid, ExecutorError> {
    Uuid::parse_str(payload_str(event, key)?).map_err(|_| corrupt(event, key))
}

fn payload_datetime(event: &WorkflowEvent, key: &str) -> Result<DateTime<Utc>, ExecutorError> {
    DateTime::parse_from_rfc3339(payload_str(event, key)?)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| corrupt(event, key))
}

fn corrupt(event: &WorkflowEvent, key: &str) -> ExecutorError {
    ExecutorError::CorruptHistory(format!(
        "workflow {}: {} event at position {} has no valid '{key}'",
        event.workflow_id, event.kind, event.position
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn instance_with(events: Vec<(EventKind, Option<usize>, serde_json::Value)>) -> WorkflowInstance {
        let mut instance = WorkflowInstance::new("order_flow", Utc::now());
        for (position, (kind, step_index, payload)) in events.into_iter().enumerate() {
            instance.events.push(WorkflowEvent {
                id: Uuid::now_v7(),
                sequence: position as u64 + 1,
                position,
                workflow_id: instance.id,
                timestamp: Utc::now(),
                kind,
                step_index,
                payload,
            });
        }
        instance
    }

    fn plan() -> Vec<Step> {
        vec![
            Step::activity("charge_card"),
            Step::wait(3600),
            Step::activity("send_email"),
        ]
    }

    #[test]
    fn indexes_completed_and_pending_steps() {
        let timer_id = Uuid::now_v7();
        let instance = instance_with(vec![
            (EventKind::WorkflowStarted, None, json!({})),
            (EventKind::ActivityCompleted, Some(0), json!({ "activity": "charge_card" })),
            (
                EventKind::TimerScheduled,
                Some(1),
                json!({ "timer_id": timer_id.to_string(), "duration": 3600, "fire_at": "2026-01-01T01:00:00Z" }),
            ),
        ]);

        let history = StepHistory::build(&instance, &plan()).unwrap();
        assert_eq!(history.started_position(), Some(0));
        assert_eq!(
            history.step(0),
            Some(&StepRecord::Activity(ActivityRecord::Completed { position: 1 }))
        );
        match history.step(1) {
            Some(StepRecord::Wait(wait)) => {
                assert_eq!(wait.timer.id, timer_id);
                assert_eq!(wait.timer.duration_secs, 3600);
                assert_eq!(wait.fired_position, None);
            }
            other => panic!("expected wait record, got {other:?}"),
        }
        assert!(history.step(2).is_none());
    }

    #[test]
    fn different_activity_name_is_nondeterministic() {
        let instance = instance_with(vec![(
            EventKind::ActivityCompleted,
            Some(0),
            json!({ "activity": "refund_card" }),
        )]);
        let err = StepHistory::build(&instance, &plan()).unwrap_err();
        assert!(matches!(err, ExecutorError::NonDeterminism { step_index: 0, .. }));
    }

    #[test]
    fn different_step_kind_is_nondeterministic() {
        let instance = instance_with(vec![(
            EventKind::ActivityCompleted,
            Some(1),
            json!({ "activity": "charge_card" }),
        )]);
        let err = StepHistory::build(&instance, &plan()).unwrap_err();
        assert!(matches!(err, ExecutorError::NonDeterminism { step_index: 1, .. }));
    }

    #[test]
    fn history_beyond_plan_is_nondeterministic() {
        let instance = instance_with(vec![(
            EventKind::ActivityCompleted,
            Some(7),
            json!({ "activity": "charge_card" }),
        )]);
        let err = StepHistory::build(&instance, &plan()).unwrap_err();
        assert!(matches!(err, ExecutorError::NonDeterminism { step_index: 7, .. }));
    }

    #[test]
    fn timer_fired_without_schedule_is_corrupt() {
        let instance = instance_with(vec![(EventKind::TimerFired, Some(1), json!({}))]);
        let err = StepHistory::build(&instance, &plan()).unwrap_err();
        assert!(matches!(err, ExecutorError::CorruptHistory(_)));
    }
}
