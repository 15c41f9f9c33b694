//! Deterministic step executor with replay.
//!
//! `DeterministicExecutor::run` walks a step plan against an instance's
//! history. Steps whose outcome is already recorded are replayed (skipped,
//! their effects are never repeated). The first step without a recorded
//! outcome is performed, its event appended and checkpointed, and the walk
//! continues. A wait whose timer has not been reported ready suspends the
//! run; the runtime calls `run` again once `collect_ready` reports it.
//!
//! # Execution flow
//!
//! 1. Serialize with any other run of the same instance.
//! 2. Terminal instance: return its outcome untouched.
//! 3. Pending instance: move to Running and record `WorkflowStarted`.
//! 4. Index history by step (`StepHistory`), rejecting non-deterministic plans.
//! 5. Replay or perform each step; suspend on an unfired wait.
//! 6. Plan exhausted: record `WorkflowCompleted`, move to Completed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use localflow_types::timer::Timer;
use localflow_types::workflow::{EventKind, Step, WorkflowEvent, WorkflowInstance, WorkflowStatus};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::activity::ActivityInvoker;
use crate::repository::workflow::WorkflowStore;
use crate::timer::scheduler::{TimerError, TimerScheduler};

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::engine::{EngineError, WorkflowEngine};
use super::replay::{ActivityRecord, StepHistory, StepRecord};

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

/// Where a call to `run` left the workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed {
        step_index: Option<usize>,
        error: String,
    },
    /// Waiting on a timer; call `run` again once it is reported ready.
    Suspended {
        step_index: usize,
        timer_id: Uuid,
        fire_at: DateTime<Utc>,
    },
}

impl RunOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Suspended { .. })
    }

    fn for_terminal(instance: &WorkflowInstance) -> Option<Self> {
        match instance.effective_status() {
            WorkflowStatus::Completed => Some(Self::Completed),
            WorkflowStatus::Failed => {
                let failed = instance
                    .events
                    .iter()
                    .rev()
                    .find(|e| e.kind == EventKind::WorkflowFailed);
                Some(Self::Failed {
                    step_index: failed
                        .and_then(|e| e.payload.get("step"))
                        .and_then(|v| v.as_u64())
                        .and_then(|v| usize::try_from(v).ok()),
                    error: instance
                        .failure_reason()
                        .unwrap_or_else(|| "workflow failed".to_string()),
                })
            }
            WorkflowStatus::Pending | WorkflowStatus::Running => None,
        }
    }
}

// ---------------------------------------------------------------------------
// DeterministicExecutor
// ---------------------------------------------------------------------------

/// Replaying step interpreter with durable checkpointing.
///
/// Generic over `R: WorkflowStore` for storage and `A: ActivityInvoker`
/// for activity dispatch.
pub struct DeterministicExecutor<R: WorkflowStore, A: ActivityInvoker> {
    engine: Arc<WorkflowEngine>,
    scheduler: Arc<TimerScheduler>,
    checkpoint: Arc<CheckpointManager<R>>,
    invoker: Arc<A>,
    activity_timeout: Duration,
    /// Timers the scheduler reported ready that no run has consumed yet.
    ready: DashMap<Uuid, Timer>,
    /// One lock per instance so that runs of the same workflow never overlap.
    run_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl<R: WorkflowStore, A: ActivityInvoker> DeterministicExecutor<R, A> {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        scheduler: Arc<TimerScheduler>,
        checkpoint: Arc<CheckpointManager<R>>,
        invoker: Arc<A>,
        activity_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            scheduler,
            checkpoint,
            invoker,
            activity_timeout,
            ready: DashMap::new(),
            run_locks: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<TimerScheduler> {
        &self.scheduler
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointManager<R>> {
        &self.checkpoint
    }

    // -----------------------------------------------------------------------
    // Ready timers
    // -----------------------------------------------------------------------

    /// Pop timers due at `now` and park them for their workflows.
    ///
    /// Returns the affected workflow IDs in fire order, without duplicates.
    pub fn collect_ready(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut workflows = Vec::new();
        for timer in self.scheduler.get_ready_timers(now) {
            if !workflows.contains(&timer.workflow_id) {
                workflows.push(timer.workflow_id);
            }
            tracing::debug!(timer_id = %timer.id, workflow_id = %timer.workflow_id, "timer ready");
            self.ready.insert(timer.id, timer);
        }
        workflows
    }

    /// Drop parked ready timers of a workflow that will never run again.
    pub fn discard_ready(&self, workflow_id: &Uuid) {
        self.ready.retain(|_, timer| timer.workflow_id != *workflow_id);
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Drive `workflow_id` through `plan` as far as it can go.
    ///
    /// Idempotent: calling it again with the same plan never repeats an
    /// effect and never appends an event that is already recorded.
    pub async fn run(&self, workflow_id: Uuid, plan: &[Step]) -> Result<RunOutcome, ExecutorError> {
        let lock = Arc::clone(self.run_locks.entry(workflow_id).or_default().value());
        let outcome = {
            let _guard = lock.lock().await;
            self.run_locked(workflow_id, plan).await
        };
        // A terminal workflow never takes the lock for real work again.
        if matches!(&outcome, Ok(o) if o.is_terminal()) {
            self.run_locks.remove(&workflow_id);
        }
        outcome
    }

    async fn run_locked(&self, workflow_id: Uuid, plan: &[Step]) -> Result<RunOutcome, ExecutorError> {
        let instance = self
            .engine
            .get(&workflow_id)
            .ok_or(EngineError::NotFound(workflow_id))?;

        if let Some(outcome) = RunOutcome::for_terminal(&instance) {
            let status = instance.effective_status();
            if instance.status != status {
                // The terminal event made it to history but the status did not.
                self.engine.update_status(workflow_id, status)?;
                self.checkpoint_instance(workflow_id).await?;
            }
            tracing::debug!(workflow_id = %workflow_id, status = %status, "workflow already terminal");
            return Ok(outcome);
        }

        let history = StepHistory::build(&instance, plan)?;

        if instance.status == WorkflowStatus::Pending {
            self.engine.update_status(workflow_id, WorkflowStatus::Running)?;
            tracing::info!(workflow_id = %workflow_id, name = %instance.name, steps = plan.len(), "workflow started");
        }
        let cursor = match history.started_position() {
            Some(position) => position + 1,
            None => {
                let payload = json!({ "name": instance.name, "steps": plan.len() });
                self.append(workflow_id, EventKind::WorkflowStarted, None, payload)
                    .await?
                    .position
                    + 1
            }
        };
        self.engine.advance_cursor(workflow_id, cursor)?;

        for (index, step) in plan.iter().enumerate() {
            let record = history.step(index);
            if let Some(record) = record {
                self.engine.advance_cursor(workflow_id, record.end_position())?;
            }

            match step {
                Step::Activity { name } => match record {
                    Some(StepRecord::Activity(ActivityRecord::Completed { .. })) => {
                        tracing::debug!(workflow_id = %workflow_id, step = index, activity = %name, "replayed activity");
                    }
                    Some(StepRecord::Activity(ActivityRecord::Failed { error, .. })) => {
                        return self.fail(workflow_id, Some(index), error.clone()).await;
                    }
                    Some(StepRecord::Wait(_)) => return Err(mismatched(workflow_id, index)),
                    None => {
                        if let Some(outcome) = self.run_activity(workflow_id, index, name).await? {
                            return Ok(outcome);
                        }
                    }
                },
                Step::Wait { seconds } => {
                    let timer = match record {
                        Some(StepRecord::Wait(wait)) if wait.fired_position.is_some() => {
                            tracing::debug!(workflow_id = %workflow_id, step = index, "replayed wait");
                            continue;
                        }
                        Some(StepRecord::Wait(wait)) => {
                            self.reregister(&wait.timer).await?;
                            wait.timer.clone()
                        }
                        Some(StepRecord::Activity(_)) => return Err(mismatched(workflow_id, index)),
                        None => match self.schedule_wait(workflow_id, index, *seconds).await {
                            Ok(timer) => timer,
                            Err(ExecutorError::Timer(err)) => {
                                self.fail(workflow_id, Some(index), err.to_string()).await?;
                                return Err(err.into());
                            }
                            Err(other) => return Err(other),
                        },
                    };

                    if !self.consume_ready(workflow_id, index, &timer).await? {
                        tracing::info!(
                            workflow_id = %workflow_id,
                            step = index,
                            timer_id = %timer.id,
                            fire_at = %timer.fire_at,
                            "workflow suspended"
                        );
                        return Ok(RunOutcome::Suspended {
                            step_index: index,
                            timer_id: timer.id,
                            fire_at: timer.fire_at,
                        });
                    }
                }
            }
        }

        self.complete(workflow_id, plan.len()).await
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel a non-terminal workflow: drop its outstanding timers, record
    /// `WorkflowFailed` with `reason`, and move it to Failed.
    ///
    /// Does not wait for an in-flight run; that run's next append is
    /// rejected with `TerminalStateViolation`.
    pub async fn cancel(&self, workflow_id: Uuid, reason: &str) -> Result<RunOutcome, ExecutorError> {
        let instance = self
            .engine
            .get(&workflow_id)
            .ok_or(EngineError::NotFound(workflow_id))?;
        let status = instance.effective_status();
        if status.is_terminal() {
            return Err(EngineError::TerminalStateViolation { workflow_id, status }.into());
        }

        for timer_id in self.scheduler.remove_workflow_timers(&workflow_id) {
            self.checkpoint.checkpoint_timer_cleared(timer_id).await?;
        }
        for timer in self.checkpoint.restore_timers().await? {
            if timer.workflow_id == workflow_id {
                self.checkpoint.checkpoint_timer_cleared(timer.id).await?;
            }
        }
        self.discard_ready(&workflow_id);

        tracing::info!(workflow_id = %workflow_id, reason, "cancelling workflow");
        let outcome = self.fail(workflow_id, None, reason.to_string()).await;
        self.run_locks.remove(&workflow_id);
        outcome
    }

    // -----------------------------------------------------------------------
    // Step effects
    // -----------------------------------------------------------------------

    /// Invoke an activity and record its outcome. Returns the final outcome
    /// if the failure ended the workflow.
    async fn run_activity(
        &self,
        workflow_id: Uuid,
        index: usize,
        name: &str,
    ) -> Result<Option<RunOutcome>, ExecutorError> {
        tracing::debug!(workflow_id = %workflow_id, step = index, activity = name, "invoking activity");
        let result = self.invoker.invoke(name, self.activity_timeout).await;

        if result.success {
            let payload = json!({
                "activity": name,
                "result": result.output,
                "elapsed_ms": result.elapsed_ms(),
                "attempts": result.attempts,
            });
            self.append(workflow_id, EventKind::ActivityCompleted, Some(index), payload)
                .await?;
            return Ok(None);
        }

        let error = result
            .error
            .clone()
            .unwrap_or_else(|| format!("activity '{name}' failed"));
        let payload = json!({
            "activity": name,
            "error": error,
            "elapsed_ms": result.elapsed_ms(),
            "attempts": result.attempts,
        });
        self.append(workflow_id, EventKind::ActivityFailed, Some(index), payload)
            .await?;
        self.fail(workflow_id, Some(index), error).await.map(Some)
    }

    /// Register a fresh timer for a wait step.
    async fn schedule_wait(
        &self,
        workflow_id: Uuid,
        index: usize,
        seconds: i64,
    ) -> Result<Timer, ExecutorError> {
        let timer = self.scheduler.schedule_timer(workflow_id, seconds)?;
        let payload = json!({
            "timer_id": timer.id.to_string(),
            "duration": seconds,
            "fire_at": timer.fire_at.to_rfc3339(),
        });
        if let Err(e) = self
            .append(workflow_id, EventKind::TimerScheduled, Some(index), payload)
            .await
        {
            // Not in history, so nothing would ever fire or remove it.
            self.scheduler.remove_timer(&timer.id);
            return Err(e);
        }
        self.checkpoint.checkpoint_timer_scheduled(&timer).await?;
        Ok(timer)
    }

    /// Make sure the scheduler knows a timer recorded in history, e.g. after
    /// a restart. No event is appended.
    async fn reregister(&self, timer: &Timer) -> Result<(), ExecutorError> {
        if self.ready.contains_key(&timer.id) || !self.scheduler.restore(timer.clone()) {
            return Ok(());
        }
        tracing::info!(timer_id = %timer.id, workflow_id = %timer.workflow_id, "re-registered timer from history");
        self.checkpoint.checkpoint_timer_scheduled(timer).await?;
        Ok(())
    }

    /// Record `TimerFired` if the scheduler has reported `timer` ready.
    async fn consume_ready(
        &self,
        workflow_id: Uuid,
        index: usize,
        timer: &Timer,
    ) -> Result<bool, ExecutorError> {
        let Some((_, fired)) = self.ready.remove(&timer.id) else {
            return Ok(false);
        };
        let payload = json!({
            "timer_id": fired.id.to_string(),
            "duration": fired.duration_secs,
        });
        self.append(workflow_id, EventKind::TimerFired, Some(index), payload)
            .await?;
        self.checkpoint.checkpoint_timer_cleared(fired.id).await?;
        tracing::debug!(workflow_id = %workflow_id, step = index, timer_id = %fired.id, "timer fired");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    async fn complete(&self, workflow_id: Uuid, steps: usize) -> Result<RunOutcome, ExecutorError> {
        if self.last_kind(workflow_id)? != Some(EventKind::WorkflowCompleted) {
            self.append(workflow_id, EventKind::WorkflowCompleted, None, json!({ "steps": steps }))
                .await?;
        }
        self.engine.update_status(workflow_id, WorkflowStatus::Completed)?;
        self.checkpoint_instance(workflow_id).await?;
        tracing::info!(workflow_id = %workflow_id, "workflow completed");
        Ok(RunOutcome::Completed)
    }

    async fn fail(
        &self,
        workflow_id: Uuid,
        step_index: Option<usize>,
        error: String,
    ) -> Result<RunOutcome, ExecutorError> {
        if self.last_kind(workflow_id)? != Some(EventKind::WorkflowFailed) {
            let payload = json!({ "step": step_index, "error": error });
            self.append(workflow_id, EventKind::WorkflowFailed, None, payload)
                .await?;
        }
        self.engine.update_status(workflow_id, WorkflowStatus::Failed)?;
        self.checkpoint_instance(workflow_id).await?;
        tracing::warn!(workflow_id = %workflow_id, step = ?step_index, error = %error, "workflow failed");
        Ok(RunOutcome::Failed { step_index, error })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Record an event, move the cursor past it and checkpoint the instance.
    async fn append(
        &self,
        workflow_id: Uuid,
        kind: EventKind,
        step_index: Option<usize>,
        payload: Value,
    ) -> Result<WorkflowEvent, ExecutorError> {
        let event = self.engine.record_event(workflow_id, kind, step_index, payload)?;
        self.engine.advance_cursor(workflow_id, event.position + 1)?;
        self.checkpoint_instance(workflow_id).await?;
        Ok(event)
    }

    async fn checkpoint_instance(&self, workflow_id: Uuid) -> Result<(), ExecutorError> {
        let snapshot = self
            .engine
            .get(&workflow_id)
            .ok_or(EngineError::NotFound(workflow_id))?;
        self.checkpoint.checkpoint_instance(&snapshot).await?;
        Ok(())
    }

    fn last_kind(&self, workflow_id: Uuid) -> Result<Option<EventKind>, ExecutorError> {
        let instance = self
            .engine
            .get(&workflow_id)
            .ok_or(EngineError::NotFound(workflow_id))?;
        Ok(instance.last_event().map(|e| e.kind))
    }
}

fn mismatched(workflow_id: Uuid, index: usize) -> ExecutorError {
    ExecutorError::CorruptHistory(format!(
        "workflow {workflow_id}: step {index} history does not match its kind"
    ))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("timer error: {0}")]
    Timer(#[from] TimerError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The recorded history could not have come from this plan.
    #[error(
        "non-deterministic replay of workflow {workflow_id} at step {step_index}: expected {expected}, history has {found}"
    )]
    NonDeterminism {
        workflow_id: Uuid,
        step_index: usize,
        expected: String,
        found: String,
    },

    #[error("corrupt workflow history: {0}")]
    CorruptHistory(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;
    use localflow_types::activity::ActivityResult;

    use super::*;
    use crate::repository::memory::InMemoryWorkflowStore;
    use crate::timer::clock::{Clock, ManualClock};

    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<String>>,
        failing: HashSet<String>,
    }

    impl RecordingInvoker {
        fn failing(names: &[&str]) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing: names.iter().map(|n| n.to_string()).collect(),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ActivityInvoker for RecordingInvoker {
        async fn invoke(&self, name: &str, _timeout: Duration) -> ActivityResult {
            self.calls.lock().unwrap().push(name.to_string());
            if self.failing.contains(name) {
                ActivityResult::failure(format!("{name} exploded"), Duration::ZERO)
            } else {
                ActivityResult::success(format!("executed: {name}"), Duration::ZERO)
            }
        }
    }

    type Store = Arc<InMemoryWorkflowStore>;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Store,
        invoker: Arc<RecordingInvoker>,
        executor: DeterministicExecutor<Store, RecordingInvoker>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(
                Arc::new(ManualClock::at_epoch()),
                Arc::new(InMemoryWorkflowStore::new()),
                RecordingInvoker::default(),
            )
        }

        fn with(clock: Arc<ManualClock>, store: Store, invoker: RecordingInvoker) -> Self {
            let engine = Arc::new(WorkflowEngine::new(clock.clone()));
            let scheduler = Arc::new(TimerScheduler::new(clock.clone()));
            let invoker = Arc::new(invoker);
            let executor = DeterministicExecutor::new(
                engine,
                scheduler,
                Arc::new(CheckpointManager::new(Arc::clone(&store))),
                Arc::clone(&invoker),
                Duration::from_secs(30),
            );
            Self {
                clock,
                store,
                invoker,
                executor,
            }
        }

        /// A fresh process over the same store and clock.
        fn restart(&self) -> Self {
            Self::with(
                Arc::clone(&self.clock),
                Arc::clone(&self.store),
                RecordingInvoker::default(),
            )
        }

        fn instance(&self, id: Uuid) -> WorkflowInstance {
            self.executor.engine().get(&id).unwrap()
        }

        fn kinds(&self, id: Uuid) -> Vec<EventKind> {
            self.instance(id).events.iter().map(|e| e.kind).collect()
        }
    }

    fn order_plan() -> Vec<Step> {
        vec![
            Step::activity("charge_card"),
            Step::wait(3600),
            Step::activity("send_email"),
        ]
    }

    #[tokio::test]
    async fn runs_activity_plan_to_completion() {
        let h = Harness::new();
        let id = h.executor.engine().create("notify").id;
        let plan = vec![Step::activity("send_email"), Step::activity("update_crm")];

        let outcome = h.executor.run(id, &plan).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(
            h.kinds(id),
            vec![
                EventKind::WorkflowStarted,
                EventKind::ActivityCompleted,
                EventKind::ActivityCompleted,
                EventKind::WorkflowCompleted,
            ]
        );
        let instance = h.instance(id);
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(instance.status, instance.derived_status());
        assert_eq!(instance.replay_cursor, instance.events.len());
        assert_eq!(h.invoker.calls(), vec!["send_email", "update_crm"]);
        assert_eq!(h.store.load_instance(&id).await.unwrap(), instance);
    }

    #[tokio::test]
    async fn rerunning_a_completed_workflow_changes_nothing() {
        let h = Harness::new();
        let id = h.executor.engine().create("notify").id;
        let plan = vec![Step::activity("send_email")];
        h.executor.run(id, &plan).await.unwrap();
        let before = h.instance(id);

        let outcome = h.executor.run(id, &plan).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(h.instance(id), before);
        assert_eq!(h.invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn activity_failure_fails_the_workflow() {
        let h = Harness::with(
            Arc::new(ManualClock::at_epoch()),
            Arc::new(InMemoryWorkflowStore::new()),
            RecordingInvoker::failing(&["charge_card"]),
        );
        let id = h.executor.engine().create("order_flow").id;

        let outcome = h.executor.run(id, &order_plan()).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                step_index: Some(0),
                error: "charge_card exploded".to_string(),
            }
        );
        assert_eq!(
            h.kinds(id),
            vec![
                EventKind::WorkflowStarted,
                EventKind::ActivityFailed,
                EventKind::WorkflowFailed,
            ]
        );
        assert_eq!(h.instance(id).status, WorkflowStatus::Failed);
        assert!(h.executor.scheduler().is_empty());

        let again = h.executor.run(id, &order_plan()).await.unwrap();
        assert_eq!(again, outcome);
        assert_eq!(h.invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn wait_suspends_until_timer_is_ready() {
        let h = Harness::new();
        let id = h.executor.engine().create("order_flow").id;

        let outcome = h.executor.run(id, &order_plan()).await.unwrap();
        let RunOutcome::Suspended { step_index, timer_id, fire_at } = outcome else {
            panic!("expected suspension, got {outcome:?}");
        };
        assert_eq!(step_index, 1);
        assert_eq!(fire_at, h.clock.now() + ChronoDuration::seconds(3600));
        assert_eq!(h.executor.scheduler().len(), 1);
        assert_eq!(h.store.load_timers().await.unwrap()[0].id, timer_id);

        // Not ready yet: another run is a no-op.
        let events_before = h.instance(id).events.len();
        assert!(matches!(
            h.executor.run(id, &order_plan()).await.unwrap(),
            RunOutcome::Suspended { .. }
        ));
        assert_eq!(h.instance(id).events.len(), events_before);
        assert!(h.executor.collect_ready(h.clock.now()).is_empty());

        h.clock.advance(ChronoDuration::seconds(3600));
        assert_eq!(h.executor.collect_ready(h.clock.now()), vec![id]);

        let outcome = h.executor.run(id, &order_plan()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(
            h.kinds(id),
            vec![
                EventKind::WorkflowStarted,
                EventKind::ActivityCompleted,
                EventKind::TimerScheduled,
                EventKind::TimerFired,
                EventKind::ActivityCompleted,
                EventKind::WorkflowCompleted,
            ]
        );
        assert_eq!(h.invoker.calls(), vec!["charge_card", "send_email"]);
        assert!(h.store.load_timers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn crash_after_first_activity_resumes_without_reinvoking() {
        let h = Harness::new();
        let engine = h.executor.engine();
        let id = engine.create("order_flow").id;
        engine.update_status(id, WorkflowStatus::Running).unwrap();
        engine
            .record_event(id, EventKind::WorkflowStarted, None, json!({ "name": "order_flow", "steps": 3 }))
            .unwrap();
        engine
            .record_event(
                id,
                EventKind::ActivityCompleted,
                Some(0),
                json!({ "activity": "charge_card", "result": "executed: charge_card" }),
            )
            .unwrap();
        h.store.save_instance(&engine.get(&id).unwrap()).await.unwrap();

        // Process dies here. A new one loads the instance and replays.
        let restarted = h.restart();
        let persisted = restarted.store.load_instance(&id).await.unwrap();
        assert_eq!(persisted.status, WorkflowStatus::Running);
        restarted.executor.engine().restore(persisted);

        let outcome = restarted.executor.run(id, &order_plan()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Suspended { step_index: 1, .. }));
        assert!(restarted.invoker.calls().is_empty());

        let kinds = restarted.kinds(id);
        assert_eq!(
            kinds.iter().filter(|k| **k == EventKind::ActivityCompleted).count(),
            1
        );
        assert_eq!(kinds.last(), Some(&EventKind::TimerScheduled));
        assert_eq!(restarted.executor.scheduler().len(), 1);
    }

    #[tokio::test]
    async fn restart_while_suspended_reregisters_the_same_timer() {
        let h = Harness::new();
        let id = h.executor.engine().create("order_flow").id;
        let RunOutcome::Suspended { timer_id, .. } = h.executor.run(id, &order_plan()).await.unwrap() else {
            panic!("expected suspension");
        };

        let restarted = h.restart();
        restarted
            .executor
            .engine()
            .restore(restarted.store.load_instance(&id).await.unwrap());
        assert!(restarted.executor.scheduler().is_empty());

        let outcome = restarted.executor.run(id, &order_plan()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Suspended { timer_id: t, .. } if t == timer_id));
        assert!(restarted.executor.scheduler().contains(&timer_id));

        restarted.clock.advance(ChronoDuration::hours(1));
        assert_eq!(restarted.executor.collect_ready(restarted.clock.now()), vec![id]);
        assert_eq!(
            restarted.executor.run(id, &order_plan()).await.unwrap(),
            RunOutcome::Completed
        );
        assert_eq!(h.invoker.calls(), vec!["charge_card"]);
        assert_eq!(restarted.invoker.calls(), vec!["send_email"]);
    }

    #[tokio::test]
    async fn negative_wait_fails_the_workflow() {
        let h = Harness::new();
        let id = h.executor.engine().create("broken").id;

        let err = h.executor.run(id, &[Step::wait(-5)]).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Timer(TimerError::InvalidDuration(-5))));

        let instance = h.instance(id);
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(instance.last_event().unwrap().kind, EventKind::WorkflowFailed);
        assert!(h.executor.scheduler().is_empty());
        assert!(h.store.load_timers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn changed_plan_is_reported_as_nondeterministic() {
        let h = Harness::new();
        let id = h.executor.engine().create("order_flow").id;
        h.executor.run(id, &order_plan()).await.unwrap();
        let before = h.instance(id);

        let changed = vec![Step::activity("refund_card"), Step::wait(3600)];
        let err = h.executor.run(id, &changed).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NonDeterminism { step_index: 0, .. }));
        assert_eq!(h.instance(id), before);
    }

    #[tokio::test]
    async fn concurrent_runs_of_one_instance_do_not_duplicate_effects() {
        let h = Harness::new();
        let id = h.executor.engine().create("notify").id;
        let plan = vec![Step::activity("send_email"), Step::activity("update_crm")];

        let (a, b) = tokio::join!(h.executor.run(id, &plan), h.executor.run(id, &plan));
        assert_eq!(a.unwrap(), RunOutcome::Completed);
        assert_eq!(b.unwrap(), RunOutcome::Completed);
        assert_eq!(h.invoker.calls(), vec!["send_email", "update_crm"]);
        assert_eq!(h.instance(id).events.len(), 4);
    }

    #[tokio::test]
    async fn cancelled_workflow_rejects_late_timer_events() {
        let h = Harness::new();
        let id = h.executor.engine().create("order_flow").id;
        let RunOutcome::Suspended { timer_id, .. } = h.executor.run(id, &order_plan()).await.unwrap() else {
            panic!("expected suspension");
        };

        let outcome = h.executor.cancel(id, "cancelled").await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                step_index: None,
                error: "cancelled".to_string(),
            }
        );
        assert!(!h.executor.scheduler().contains(&timer_id));
        assert!(h.store.load_timers().await.unwrap().is_empty());

        let late = h.executor.engine().record_event(
            id,
            EventKind::TimerFired,
            Some(1),
            json!({ "timer_id": timer_id.to_string(), "duration": 3600 }),
        );
        assert!(matches!(late, Err(EngineError::TerminalStateViolation { .. })));

        h.clock.advance(ChronoDuration::hours(2));
        assert!(h.executor.collect_ready(h.clock.now()).is_empty());
        assert_eq!(h.executor.run(id, &order_plan()).await.unwrap(), outcome);

        let err = h.executor.cancel(id, "cancelled").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Engine(EngineError::TerminalStateViolation { .. })));
    }

    #[tokio::test]
    async fn empty_plan_completes_immediately() {
        let h = Harness::new();
        let id = h.executor.engine().create("noop").id;
        assert_eq!(h.executor.run(id, &[]).await.unwrap(), RunOutcome::Completed);
        assert_eq!(
            h.kinds(id),
            vec![EventKind::WorkflowStarted, EventKind::WorkflowCompleted]
        );
    }

    #[tokio::test]
    async fn unknown_workflow_is_an_engine_error() {
        let h = Harness::new();
        let err = h.executor.run(Uuid::now_v7(), &[]).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Engine(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_survives_a_crash_before_the_status_is_saved() {
        let h = Harness::new();
        let id = h.executor.engine().create("order_flow").id;
        let RunOutcome::Suspended { .. } = h.executor.run(id, &order_plan()).await.unwrap() else {
            panic!("expected suspension");
        };

        // Cancellation got as far as the WorkflowFailed event; the status
        // update was never saved.
        let engine = h.executor.engine();
        engine
            .record_event(id, EventKind::WorkflowFailed, None, json!({ "step": null, "error": "cancelled" }))
            .unwrap();
        h.store.save_instance(&engine.get(&id).unwrap()).await.unwrap();

        let restarted = h.restart();
        let persisted = restarted.store.load_instance(&id).await.unwrap();
        assert_eq!(persisted.status, WorkflowStatus::Running);
        assert_eq!(persisted.derived_status(), WorkflowStatus::Failed);
        restarted.executor.engine().restore(persisted);

        let expected = RunOutcome::Failed {
            step_index: None,
            error: "cancelled".to_string(),
        };
        assert_eq!(restarted.executor.run(id, &order_plan()).await.unwrap(), expected);
        assert!(restarted.executor.scheduler().is_empty());

        restarted.clock.advance(ChronoDuration::hours(2));
        assert!(restarted.executor.collect_ready(restarted.clock.now()).is_empty());
        assert_eq!(restarted.executor.run(id, &order_plan()).await.unwrap(), expected);

        assert!(restarted.invoker.calls().is_empty());
        assert_eq!(
            restarted.kinds(id),
            vec![
                EventKind::WorkflowStarted,
                EventKind::ActivityCompleted,
                EventKind::TimerScheduled,
                EventKind::WorkflowFailed,
            ]
        );
        assert_eq!(restarted.instance(id).status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn rejected_timer_event_leaves_no_timer_behind() {
        let h = Harness::new();
        let id = h.executor.engine().create("order_flow").id;
        h.executor.cancel(id, "cancelled").await.unwrap();

        let err = h.executor.schedule_wait(id, 1, 60).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Engine(EngineError::TerminalStateViolation { .. })));
        assert!(h.executor.scheduler().is_empty());
        assert!(h.store.load_timers().await.unwrap().is_empty());
    }

    #[derive(Default)]
    struct GatedInvoker {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        calls: Mutex<Vec<String>>,
    }

    impl ActivityInvoker for GatedInvoker {
        async fn invoke(&self, name: &str, _timeout: Duration) -> ActivityResult {
            self.calls.lock().unwrap().push(name.to_string());
            self.entered.notify_one();
            self.release.notified().await;
            ActivityResult::success(format!("executed: {name}"), Duration::ZERO)
        }
    }

    #[tokio::test]
    async fn cancel_during_an_activity_rejects_its_result() {
        let clock = Arc::new(ManualClock::at_epoch());
        let store: Store = Arc::new(InMemoryWorkflowStore::new());
        let invoker = Arc::new(GatedInvoker::default());
        let executor = DeterministicExecutor::new(
            Arc::new(WorkflowEngine::new(clock.clone())),
            Arc::new(TimerScheduler::new(clock.clone())),
            Arc::new(CheckpointManager::new(Arc::clone(&store))),
            Arc::clone(&invoker),
            Duration::from_secs(30),
        );
        let id = executor.engine().create("order_flow").id;
        let plan = order_plan();

        let (run, cancel) = tokio::join!(executor.run(id, &plan), async {
            invoker.entered.notified().await;
            let outcome = executor.cancel(id, "cancelled").await;
            invoker.release.notify_one();
            outcome
        });

        assert!(matches!(cancel.unwrap(), RunOutcome::Failed { step_index: None, .. }));
        assert!(matches!(
            run.unwrap_err(),
            ExecutorError::Engine(EngineError::TerminalStateViolation { .. })
        ));

        let instance = executor.engine().get(&id).unwrap();
        let kinds: Vec<_> = instance.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::WorkflowStarted, EventKind::WorkflowFailed]);
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(store.load_instance(&id).await.unwrap(), instance);
        assert!(executor.scheduler().is_empty());
        assert_eq!(invoker.calls.lock().unwrap().clone(), vec!["charge_card"]);
    }

    #[tokio::test]
    async fn run_locks_are_released_once_a_workflow_ends() {
        let h = Harness::new();
        let done = h.executor.engine().create("notify").id;
        h.executor.run(done, &[Step::activity("send_email")]).await.unwrap();
        assert!(!h.executor.run_locks.contains_key(&done));

        let waiting = h.executor.engine().create("order_flow").id;
        h.executor.run(waiting, &order_plan()).await.unwrap();
        assert!(h.executor.run_locks.contains_key(&waiting));

        h.executor.cancel(waiting, "cancelled").await.unwrap();
        assert!(!h.executor.run_locks.contains_key(&waiting));
    }
}
