//! Workflow runtime: plan registry, bounded worker pool, timer polling,
//! crash recovery and cancellation.
//!
//! The runtime owns one engine, one timer scheduler and one executor, all
//! sharing a clock and a store. Instances are driven concurrently on a
//! `JoinSet`, bounded by a `Semaphore` sized from the worker pool setting;
//! runs of the same instance are still serialized by the executor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use localflow_types::config::GlobalConfig;
use localflow_types::workflow::{EventKind, Step, WorkflowDefinition, WorkflowInstance};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activity::ActivityInvoker;
use crate::repository::workflow::WorkflowStore;
use crate::timer::clock::Clock;
use crate::timer::scheduler::TimerScheduler;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::engine::{EngineError, WorkflowEngine};
use super::executor::{DeterministicExecutor, ExecutorError, RunOutcome};

/// Reason recorded on workflows cancelled through the runtime.
pub const CANCELLED_REASON: &str = "cancelled";

// ---------------------------------------------------------------------------
// Options and reports
// ---------------------------------------------------------------------------

/// Tunables for a `WorkflowRuntime`.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub worker_pool_size: usize,
    pub activity_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::from(&GlobalConfig::default())
    }
}

impl From<&GlobalConfig> for RuntimeOptions {
    fn from(config: &GlobalConfig) -> Self {
        Self {
            worker_pool_size: config.worker_pool_size.max(1),
            activity_timeout: Duration::from_secs(config.activity_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// Result of driving one instance.
pub type DriveResult = (Uuid, Result<RunOutcome, RuntimeError>);

/// Latest known outcome per workflow across one or more drives.
#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub suspended: Vec<Uuid>,
    pub errors: Vec<(Uuid, String)>,
}

impl RunReport {
    pub fn absorb(&mut self, results: Vec<DriveResult>) {
        for (id, result) in results {
            self.suspended.retain(|s| *s != id);
            self.errors.retain(|(e, _)| *e != id);
            match result {
                Ok(RunOutcome::Completed) => self.completed.push(id),
                Ok(RunOutcome::Failed { .. }) => self.failed.push(id),
                Ok(RunOutcome::Suspended { .. }) => self.suspended.push(id),
                Err(e) => self.errors.push((id, e.to_string())),
            }
        }
    }

    /// Fold a later report into this one; `other` wins for shared IDs.
    pub fn merge(&mut self, other: RunReport) {
        let later: HashSet<Uuid> = other
            .completed
            .iter()
            .chain(&other.failed)
            .chain(&other.suspended)
            .copied()
            .chain(other.errors.iter().map(|(id, _)| *id))
            .collect();
        self.suspended.retain(|id| !later.contains(id));
        self.errors.retain(|(id, _)| !later.contains(id));
        self.completed.extend(other.completed);
        self.failed.extend(other.failed);
        self.suspended.extend(other.suspended);
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
            && self.failed.is_empty()
            && self.suspended.is_empty()
            && self.errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// WorkflowRuntime
// ---------------------------------------------------------------------------

pub struct WorkflowRuntime<R: WorkflowStore, A: ActivityInvoker> {
    executor: Arc<DeterministicExecutor<R, A>>,
    plans: DashMap<String, Arc<[Step]>>,
    pool: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl<R: WorkflowStore + 'static, A: ActivityInvoker + 'static> WorkflowRuntime<R, A> {
    pub fn new(store: R, invoker: A, clock: Arc<dyn Clock>, options: RuntimeOptions) -> Self {
        let engine = Arc::new(WorkflowEngine::new(Arc::clone(&clock)));
        let scheduler = Arc::new(TimerScheduler::new(Arc::clone(&clock)));
        let executor = DeterministicExecutor::new(
            engine,
            scheduler,
            Arc::new(CheckpointManager::new(store)),
            Arc::new(invoker),
            options.activity_timeout,
        );
        Self {
            executor: Arc::new(executor),
            plans: DashMap::new(),
            pool: Arc::new(Semaphore::new(options.worker_pool_size.max(1))),
            clock,
            poll_interval: options.poll_interval,
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        self.executor.engine()
    }

    pub fn scheduler(&self) -> &Arc<TimerScheduler> {
        self.executor.scheduler()
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointManager<R>> {
        self.executor.checkpoint()
    }

    pub fn executor(&self) -> &Arc<DeterministicExecutor<R, A>> {
        &self.executor
    }

    // -----------------------------------------------------------------------
    // Plans
    // -----------------------------------------------------------------------

    /// Bind `name` to a step plan for this process.
    pub fn register_plan(&self, name: impl Into<String>, steps: Vec<Step>) {
        let name = name.into();
        tracing::debug!(name = %name, steps = steps.len(), "registered plan");
        self.plans.insert(name, Arc::from(steps));
    }

    /// Persist a compiled definition and register its plan.
    pub async fn register_definition(&self, def: &WorkflowDefinition) -> Result<(), RuntimeError> {
        self.checkpoint().save_definition(def).await?;
        self.register_plan(def.name.clone(), def.steps.clone());
        Ok(())
    }

    /// Register the plan of every persisted definition. Returns how many.
    pub async fn load_definitions(&self) -> Result<usize, RuntimeError> {
        let defs = self.checkpoint().definitions().await?;
        let count = defs.len();
        for def in defs {
            self.register_plan(def.name, def.steps);
        }
        Ok(count)
    }

    pub fn plan(&self, name: &str) -> Option<Arc<[Step]>> {
        self.plans.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn plan_for(&self, workflow_id: &Uuid) -> Result<Arc<[Step]>, RuntimeError> {
        let instance = self
            .engine()
            .get(workflow_id)
            .ok_or(EngineError::NotFound(*workflow_id))?;
        self.plan(&instance.name)
            .ok_or(RuntimeError::PlanNotFound(instance.name))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create and persist a pending instance of a registered workflow.
    pub async fn start(&self, name: &str) -> Result<WorkflowInstance, RuntimeError> {
        if !self.plans.contains_key(name) {
            return Err(RuntimeError::PlanNotFound(name.to_string()));
        }
        let instance = self.engine().create(name);
        self.checkpoint().checkpoint_instance(&instance).await?;
        Ok(instance)
    }

    /// Run one instance against its registered plan.
    pub async fn drive(&self, workflow_id: Uuid) -> Result<RunOutcome, RuntimeError> {
        let plan = self.plan_for(&workflow_id)?;
        let outcome = self.executor.run(workflow_id, &plan).await?;
        self.persist_event_log().await?;
        Ok(outcome)
    }

    /// Run several instances concurrently, at most `worker_pool_size` at a time.
    pub async fn drive_many(&self, workflow_ids: Vec<Uuid>) -> Result<Vec<DriveResult>, RuntimeError> {
        let mut results = Vec::with_capacity(workflow_ids.len());
        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::new();

        for workflow_id in workflow_ids {
            let plan = match self.plan_for(&workflow_id) {
                Ok(plan) => plan,
                Err(e) => {
                    results.push((workflow_id, Err(e)));
                    continue;
                }
            };
            let executor = Arc::clone(&self.executor);
            let pool = Arc::clone(&self.pool);
            let handle = tasks.spawn(async move {
                let _permit = pool.acquire_owned().await;
                executor
                    .run(workflow_id, &plan)
                    .await
                    .map_err(RuntimeError::from)
            });
            in_flight.insert(handle.id(), workflow_id);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (task_id, outcome) = match joined {
                Ok((task_id, outcome)) => (task_id, outcome),
                Err(e) => {
                    let error = e.to_string();
                    (e.id(), Err(RuntimeError::Join(error)))
                }
            };
            let Some(workflow_id) = in_flight.remove(&task_id) else {
                continue;
            };
            if let Err(RuntimeError::Join(error)) = &outcome {
                tracing::error!(workflow_id = %workflow_id, error = %error, "workflow task aborted");
            }
            results.push((workflow_id, outcome));
        }

        for (workflow_id, result) in &results {
            if let Err(e) = result {
                tracing::warn!(workflow_id = %workflow_id, error = %e, "workflow run failed");
            }
        }

        self.persist_event_log().await?;
        Ok(results)
    }

    /// Deliver due timers and re-run the workflows waiting on them.
    pub async fn tick(&self) -> Result<Vec<DriveResult>, RuntimeError> {
        let ready = self.executor.collect_ready(self.clock.now());
        if ready.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(workflows = ready.len(), "resuming workflows with ready timers");
        self.drive_many(ready).await
    }

    /// Tick until no timers remain or `cancel` fires.
    ///
    /// Sleeps until the next fire time, never longer than the poll interval.
    pub async fn run_until_idle(&self, cancel: CancellationToken) -> Result<RunReport, RuntimeError> {
        let mut report = RunReport::default();
        loop {
            report.absorb(self.tick().await?);
            if self.scheduler().is_empty() {
                break;
            }
            let delay = self.next_wake_delay();
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(pending_timers = self.scheduler().len(), "run loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(report)
    }

    fn next_wake_delay(&self) -> Duration {
        match self.scheduler().next_fire_at() {
            Some(fire_at) => (fire_at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.poll_interval),
            None => self.poll_interval,
        }
    }

    /// Cancel a non-terminal workflow and persist the result.
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<RunOutcome, RuntimeError> {
        let outcome = self.executor.cancel(workflow_id, CANCELLED_REASON).await?;
        self.persist_event_log().await?;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Reload instances, the event log and timers from the store.
    ///
    /// Timers that already fired or belong to terminal (or unknown)
    /// workflows are dropped from the store instead of being rescheduled.
    /// Returns the IDs of non-terminal instances, oldest first.
    pub async fn recover(&self) -> Result<Vec<Uuid>, RuntimeError> {
        let instances = self.checkpoint().restore_instances().await?;
        let mut active = Vec::new();
        let mut fired = HashSet::new();
        let mut known = HashSet::new();

        for instance in instances {
            known.insert(instance.id);
            let status = instance.effective_status();
            if !status.is_terminal() {
                active.push(instance.id);
            }
            let lagging = status != instance.status;
            fired.extend(
                instance
                    .events
                    .iter()
                    .filter(|e| e.kind == EventKind::TimerFired)
                    .filter_map(|e| e.payload.get("timer_id")?.as_str()?.parse::<Uuid>().ok()),
            );
            let id = instance.id;
            self.engine().restore(instance);
            if lagging {
                if let Some(repaired) = self.engine().get(&id) {
                    self.checkpoint().checkpoint_instance(&repaired).await?;
                }
            }
        }

        let log = self.checkpoint().restore_event_log().await?;
        self.engine().restore_event_log(log);

        let mut restored = 0;
        for timer in self.checkpoint().restore_timers().await? {
            let live = active.contains(&timer.workflow_id) && !fired.contains(&timer.id);
            if !live {
                tracing::debug!(timer_id = %timer.id, "dropping stale timer");
                self.checkpoint().checkpoint_timer_cleared(timer.id).await?;
                continue;
            }
            if self.scheduler().restore(timer) {
                restored += 1;
            }
        }

        tracing::info!(
            instances = known.len(),
            active = active.len(),
            timers = restored,
            "recovered workflow state"
        );
        Ok(active)
    }

    /// Persist the global event log.
    pub async fn persist_event_log(&self) -> Result<(), RuntimeError> {
        let log = self.engine().event_log();
        self.checkpoint().checkpoint_event_log(&log).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("no plan registered for workflow '{0}'")]
    PlanNotFound(String),

    #[error("workflow task failed: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
