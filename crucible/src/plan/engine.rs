//! Execution Plan Engine: the component that turns a set of
//! [`ExecutionStep`]s into tool calls, in the order and concurrency its
//! [`SchedulingMode`] dictates, honoring permissions, retries, and rollback.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus, EventPayload};
use crate::permission::{Decision, PermissionArbiter, PermissionCheckInput};
use crate::tool::{ToolContext, ToolRegistry};

use super::graph::DependencyGraph;
use super::rollback::RollbackStack;
use super::scheduler::{self, SchedulingMode};
use super::step::{ExecutionStep, StepStatus};

/// Per-plan tunables. Every scheduling mode honors `max_parallel`,
/// per-step timeouts, and the plan timeout.
#[derive(Debug, Clone)]
pub struct PlanConfig {
    /// Maximum steps running concurrently.
    pub max_parallel: usize,
    /// Whether a `Failed` step triggers rollback of completed steps.
    pub rollback_on_failure: bool,
    /// Whether a recoverable failure is retried (subject to each step's
    /// own `max_retries`).
    pub retry_failed: bool,
    /// Default per-step timeout, used when a step does not set its own.
    pub step_timeout: Duration,
    /// Overall wall-clock budget for the plan.
    pub plan_timeout: Duration,
    /// Whether `Safe`/`Low`-risk tools are auto-approved without a prompt.
    pub auto_approve: bool,
    /// Tool ids that always require a prompt regardless of risk level.
    pub require_approval: HashSet<String>,
    /// Base retry backoff.
    pub retry_base: Duration,
    /// Backoff multiplier per retry attempt.
    pub retry_multiplier: f64,
    /// Backoff ceiling.
    pub retry_max_backoff: Duration,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            rollback_on_failure: false,
            retry_failed: true,
            step_timeout: Duration::from_secs(30),
            plan_timeout: Duration::from_secs(300),
            auto_approve: false,
            require_approval: HashSet::new(),
            retry_base: Duration::from_millis(200),
            retry_multiplier: 2.0,
            retry_max_backoff: Duration::from_secs(10),
        }
    }
}

impl crate::provider::FromEnv for PlanConfig {
    /// Reads `CRUCIBLE_PLAN_MAX_PARALLEL`, `CRUCIBLE_PLAN_ROLLBACK_ON_FAILURE`,
    /// `CRUCIBLE_PLAN_RETRY_FAILED`, `CRUCIBLE_PLAN_STEP_TIMEOUT_MS`,
    /// `CRUCIBLE_PLAN_TIMEOUT_MS`, and `CRUCIBLE_PLAN_AUTO_APPROVE`.
    /// `require_approval` has no environment representation and is always
    /// left empty.
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_parallel: crate::provider::env_or("CRUCIBLE_PLAN_MAX_PARALLEL", default.max_parallel),
            rollback_on_failure: crate::provider::env_or("CRUCIBLE_PLAN_ROLLBACK_ON_FAILURE", default.rollback_on_failure),
            retry_failed: crate::provider::env_or("CRUCIBLE_PLAN_RETRY_FAILED", default.retry_failed),
            step_timeout: Duration::from_millis(crate::provider::env_or(
                "CRUCIBLE_PLAN_STEP_TIMEOUT_MS",
                u64::try_from(default.step_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
            plan_timeout: Duration::from_millis(crate::provider::env_or(
                "CRUCIBLE_PLAN_TIMEOUT_MS",
                u64::try_from(default.plan_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
            auto_approve: crate::provider::env_or("CRUCIBLE_PLAN_AUTO_APPROVE", default.auto_approve),
            ..default
        }
    }
}

/// A plan's place in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Created but not yet validated.
    Created,
    /// Validating the dependency graph.
    Validating,
    /// Steps are being dispatched.
    Running,
    /// Execution suspended; resumable.
    Paused,
    /// Every step reached a terminal, non-failed status.
    Completed,
    /// At least one step ended `Failed` and rollback either did not run or
    /// did not fully recover.
    Failed,
    /// A failure triggered rollback, and rollback ran to completion.
    RolledBack,
    /// Cancelled before completion.
    Cancelled,
}

/// Step-outcome counters, updated as the plan runs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PlanMetrics {
    /// Total steps in the plan.
    pub total_steps: usize,
    /// Steps that reached `Completed`.
    pub completed_steps: usize,
    /// Steps that reached `Failed`.
    pub failed_steps: usize,
    /// Steps that reached `Skipped`.
    pub skipped_steps: usize,
    /// Retry attempts made across all steps.
    pub retries: usize,
    /// Number of times this plan's rollback ran to completion.
    pub rollback_count: usize,
}

/// An execution plan: its steps, dependency graph, scheduling mode, and
/// run-time state.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Unique plan id.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    steps: HashMap<String, ExecutionStep>,
    order: Vec<String>,
    graph: DependencyGraph,
    /// Scheduling mode this plan runs under.
    pub mode: SchedulingMode,
    /// Current lifecycle status.
    pub status: PlanStatus,
    /// Per-plan configuration.
    pub config: PlanConfig,
    /// Read-only snapshot of the caller's context variables at plan
    /// creation, handed to every step's [`ToolContext`](crate::tool::ToolContext).
    context_variables: HashMap<String, Value>,
    /// Step-outcome counters.
    pub metrics: PlanMetrics,
    /// Creation timestamp.
    pub created_at: u64,
    /// When the plan transitioned to `Running` for the first time.
    pub started_at: Option<u64>,
    /// When the plan reached a terminal status.
    pub completed_at: Option<u64>,
}

impl ExecutionPlan {
    /// Read-only access to a step by id.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&ExecutionStep> {
        self.steps.get(step_id)
    }

    /// All steps, in the order they were supplied at creation.
    #[must_use]
    pub fn steps(&self) -> Vec<&ExecutionStep> {
        self.order.iter().filter_map(|id| self.steps.get(id)).collect()
    }
}

struct CancelToken {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    fn new() -> Self {
        Self { cancelled: AtomicBool::new(false), notify: Notify::new() }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    fn new() -> Self {
        Self { paused: AtomicBool::new(false), notify: Notify::new() }
    }

    fn set(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        if !paused {
            self.notify.notify_waiters();
        }
    }

    async fn wait_if_paused(&self) {
        while self.paused.load(Ordering::SeqCst) {
            self.notify.notified().await;
        }
    }
}

/// The Execution Plan Engine: creates, runs, and introspects plans.
pub struct ExecutionPlanEngine {
    tool_registry: Arc<tokio::sync::RwLock<ToolRegistry>>,
    permission_arbiter: Arc<PermissionArbiter>,
    event_bus: Arc<EventBus>,
    plans: tokio::sync::Mutex<HashMap<String, ExecutionPlan>>,
    rollback_stacks: tokio::sync::Mutex<HashMap<String, RollbackStack>>,
    cancel_tokens: std::sync::Mutex<HashMap<String, Arc<CancelToken>>>,
    pause_gates: std::sync::Mutex<HashMap<String, Arc<PauseGate>>>,
}

impl ExecutionPlanEngine {
    /// Build an engine bound to the given collaborators.
    #[must_use]
    pub fn new(
        tool_registry: Arc<tokio::sync::RwLock<ToolRegistry>>,
        permission_arbiter: Arc<PermissionArbiter>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            tool_registry,
            permission_arbiter,
            event_bus,
            plans: tokio::sync::Mutex::new(HashMap::new()),
            rollback_stacks: tokio::sync::Mutex::new(HashMap::new()),
            cancel_tokens: std::sync::Mutex::new(HashMap::new()),
            pause_gates: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Validate `steps` and store a new, `Created` plan. `context_variables`
    /// is a read-only snapshot handed to every step's `ToolContext` at
    /// dispatch time.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPlan`] on a cycle, a dependency
    /// referencing a missing step, or a duplicate step id.
    pub async fn create_plan(
        &self,
        plan_id: impl Into<String>,
        session_id: impl Into<String>,
        steps: Vec<ExecutionStep>,
        mode: SchedulingMode,
        config: PlanConfig,
        context_variables: HashMap<String, Value>,
        now: u64,
    ) -> Result<String> {
        let plan_id = plan_id.into();
        let graph = DependencyGraph::build(&steps).map_err(EngineError::InvalidPlan)?;
        let order: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
        let total_steps = steps.len();
        let steps_by_id: HashMap<String, ExecutionStep> =
            steps.into_iter().map(|s| (s.id.clone(), s)).collect();

        let plan = ExecutionPlan {
            id: plan_id.clone(),
            session_id: session_id.into(),
            steps: steps_by_id,
            order,
            graph,
            mode,
            status: PlanStatus::Created,
            config,
            context_variables,
            metrics: PlanMetrics { total_steps, ..PlanMetrics::default() },
            created_at: now,
            started_at: None,
            completed_at: None,
        };

        self.plans.lock().await.insert(plan_id.clone(), plan);
        self.rollback_stacks.lock().await.insert(plan_id.clone(), RollbackStack::new());
        self.publish(&plan_id, EventPayload::PlanCreated { plan_id: plan_id.clone() }, now);
        Ok(plan_id)
    }

    /// A read-only snapshot of a plan.
    pub async fn get_plan(&self, plan_id: &str) -> Option<ExecutionPlan> {
        self.plans.lock().await.get(plan_id).cloned()
    }

    /// Cancel a plan. Idempotent; cancelling a plan that already reached a
    /// terminal status is a no-op.
    pub async fn cancel(&self, plan_id: &str) {
        if let Some(token) = self.cancel_tokens.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(plan_id) {
            token.cancel();
        }
        let mut plans = self.plans.lock().await;
        if let Some(plan) = plans.get_mut(plan_id) {
            if !is_terminal(plan.status) {
                plan.status = PlanStatus::Cancelled;
            }
        }
    }

    /// Pause a running plan. Idempotent; pausing a completed plan is a
    /// no-op.
    pub async fn pause(&self, plan_id: &str) {
        let mut plans = self.plans.lock().await;
        if let Some(plan) = plans.get_mut(plan_id) {
            if plan.status == PlanStatus::Running {
                plan.status = PlanStatus::Paused;
                if let Some(gate) = self.pause_gates.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(plan_id) {
                    gate.set(true);
                }
            }
        }
    }

    /// Resume a paused plan. Idempotent.
    pub async fn resume(&self, plan_id: &str) {
        let mut plans = self.plans.lock().await;
        if let Some(plan) = plans.get_mut(plan_id) {
            if plan.status == PlanStatus::Paused {
                plan.status = PlanStatus::Running;
                if let Some(gate) = self.pause_gates.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(plan_id) {
                    gate.set(false);
                }
            }
        }
    }

    fn publish(&self, plan_id: &str, payload: EventPayload, now: u64) {
        self.event_bus.publish(Event::new(now, plan_id.to_string(), payload));
    }

    /// Run `plan_id` to completion.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] if the plan is not `Created`.
    pub async fn execute(&self, plan_id: &str, now: impl Fn() -> u64 + Send + Sync) -> Result<PlanStatus> {
        {
            let mut plans = self.plans.lock().await;
            let plan = plans.get_mut(plan_id).ok_or_else(|| EngineError::InvalidState(format!("unknown plan '{plan_id}'")))?;
            if plan.status != PlanStatus::Created {
                return Err(EngineError::InvalidState(format!(
                    "plan '{plan_id}' is not in Created state"
                )));
            }
            plan.status = PlanStatus::Validating;
        }

        let token = Arc::new(CancelToken::new());
        self.cancel_tokens.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(plan_id.to_string(), token.clone());
        let gate = Arc::new(PauseGate::new());
        self.pause_gates.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(plan_id.to_string(), gate.clone());

        let start = now();
        {
            let mut plans = self.plans.lock().await;
            let plan = plans.get_mut(plan_id).expect("plan exists");
            plan.status = PlanStatus::Running;
            plan.started_at = Some(start);
        }
        self.publish(plan_id, EventPayload::PlanStarted { plan_id: plan_id.to_string() }, start);

        let plan_timeout = { self.plans.lock().await.get(plan_id).expect("plan exists").config.plan_timeout };

        let run = self.run_steps(plan_id, &token, &gate, &now);
        let outcome = tokio::select! {
            () = token.cancelled() => Err(EngineError::PlanCancelled(plan_id.to_string())),
            () = tokio::time::sleep(plan_timeout) => Err(EngineError::PlanTimeout(plan_id.to_string())),
            result = run => result,
        };

        let finished_at = now();
        let mut plans = self.plans.lock().await;
        let plan = plans.get_mut(plan_id).expect("plan exists");

        match outcome {
            Ok(()) => {
                let any_failed = plan.steps.values().any(|s| s.status == StepStatus::Failed);
                if any_failed {
                    drop(plans);
                    let status = self.finish_failed(plan_id, finished_at).await;
                    return Ok(status);
                }
                plan.status = PlanStatus::Completed;
                plan.completed_at = Some(finished_at);
                drop(plans);
                self.publish(plan_id, EventPayload::PlanCompleted { plan_id: plan_id.to_string() }, finished_at);
                Ok(PlanStatus::Completed)
            }
            Err(EngineError::PlanTimeout(_)) => {
                token.cancel();
                plan.status = PlanStatus::Failed;
                plan.completed_at = Some(finished_at);
                drop(plans);
                self.publish(
                    plan_id,
                    EventPayload::PlanFailed { plan_id: plan_id.to_string(), reason: "plan timeout".to_string() },
                    finished_at,
                );
                Ok(PlanStatus::Failed)
            }
            Err(EngineError::PlanCancelled(_)) => {
                plan.status = PlanStatus::Cancelled;
                plan.completed_at = Some(finished_at);
                Ok(PlanStatus::Cancelled)
            }
            Err(other) => {
                plan.status = PlanStatus::Failed;
                plan.completed_at = Some(finished_at);
                drop(plans);
                self.publish(
                    plan_id,
                    EventPayload::PlanFailed { plan_id: plan_id.to_string(), reason: other.to_string() },
                    finished_at,
                );
                Err(other)
            }
        }
    }

    async fn finish_failed(&self, plan_id: &str, now: u64) -> PlanStatus {
        let rollback_on_failure = self.plans.lock().await.get(plan_id).map(|p| p.config.rollback_on_failure).unwrap_or(false);

        if rollback_on_failure {
            self.publish(plan_id, EventPayload::RollbackStarted { plan_id: plan_id.to_string() }, now);
            let mut stacks = self.rollback_stacks.lock().await;
            if let Some(stack) = stacks.get_mut(plan_id) {
                let _outcomes = stack.unwind(|_step_id, _effect| {
                    // Tool-specific undo behavior is outside this engine's
                    // remit; best-effort acknowledgement only.
                    Ok(())
                });
            }
            self.publish(plan_id, EventPayload::RollbackCompleted { plan_id: plan_id.to_string() }, now);

            let mut plans = self.plans.lock().await;
            let plan = plans.get_mut(plan_id).expect("plan exists");
            plan.status = PlanStatus::RolledBack;
            plan.completed_at = Some(now);
            plan.metrics.rollback_count += 1;
            return PlanStatus::RolledBack;
        }

        let mut plans = self.plans.lock().await;
        let plan = plans.get_mut(plan_id).expect("plan exists");
        plan.status = PlanStatus::Failed;
        plan.completed_at = Some(now);
        drop(plans);
        self.publish(
            plan_id,
            EventPayload::PlanFailed { plan_id: plan_id.to_string(), reason: "one or more steps failed".to_string() },
            now,
        );
        PlanStatus::Failed
    }

    async fn run_steps(
        &self,
        plan_id: &str,
        token: &Arc<CancelToken>,
        gate: &Arc<PauseGate>,
        now: &(impl Fn() -> u64 + Send + Sync),
    ) -> Result<()> {
        let mode = self.plans.lock().await.get(plan_id).expect("plan exists").mode;
        match mode {
            SchedulingMode::Sequential => self.run_sequential(plan_id, token, gate, now).await,
            SchedulingMode::Parallel => self.run_parallel_rounds(plan_id, token, gate, now).await,
            SchedulingMode::Adaptive => self.run_concurrent(plan_id, token, gate, now, false).await,
            SchedulingMode::Priority => self.run_concurrent(plan_id, token, gate, now, true).await,
        }
    }

    async fn run_sequential(
        &self,
        plan_id: &str,
        token: &Arc<CancelToken>,
        gate: &Arc<PauseGate>,
        now: &(impl Fn() -> u64 + Send + Sync),
    ) -> Result<()> {
        loop {
            gate.wait_if_paused().await;
            if token.is_cancelled() {
                return Ok(());
            }

            let (order, ready_ids, all_settled) = self.ready_snapshot(plan_id).await;
            let Some(next_id) = scheduler::select_sequential(&order, &ready_ids).map(str::to_string) else {
                if all_settled {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            };

            let outcome = self.execute_one_step(plan_id, &next_id, token, now).await;
            if outcome == StepOutcome::AbortPlan {
                return Ok(());
            }
        }
    }

    async fn run_parallel_rounds(
        &self,
        plan_id: &str,
        token: &Arc<CancelToken>,
        gate: &Arc<PauseGate>,
        now: &(impl Fn() -> u64 + Send + Sync),
    ) -> Result<()> {
        loop {
            gate.wait_if_paused().await;
            if token.is_cancelled() {
                return Ok(());
            }

            let (order, ready_ids, all_settled) = self.ready_snapshot(plan_id).await;
            if ready_ids.is_empty() {
                if all_settled {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }

            let max_parallel = self.plans.lock().await.get(plan_id).expect("plan exists").config.max_parallel;
            let batch = scheduler::select_parallel_batch(&order, &ready_ids, max_parallel);

            let mut in_flight = FuturesUnordered::new();
            for id in batch {
                in_flight.push(self.execute_one_step(plan_id, &id, token, now));
            }
            while in_flight.next().await.is_some() {}
        }
    }

    async fn run_concurrent(
        &self,
        plan_id: &str,
        token: &Arc<CancelToken>,
        gate: &Arc<PauseGate>,
        now: &(impl Fn() -> u64 + Send + Sync),
        priority_order: bool,
    ) -> Result<()> {
        let mut in_flight = FuturesUnordered::new();

        loop {
            gate.wait_if_paused().await;
            if token.is_cancelled() {
                return Ok(());
            }

            let (order, ready_ids, all_settled) = self.ready_snapshot(plan_id).await;
            let max_parallel = self.plans.lock().await.get(plan_id).expect("plan exists").config.max_parallel;

            let fill = if priority_order {
                let steps_by_id = self.plans.lock().await.get(plan_id).expect("plan exists").steps.clone();
                scheduler::select_priority_fill(&order, &steps_by_id, &ready_ids, in_flight.len(), max_parallel)
            } else {
                scheduler::select_adaptive_fill(&order, &ready_ids, in_flight.len(), max_parallel)
            };

            for id in fill {
                in_flight.push(self.execute_one_step(plan_id, &id, token, now));
            }

            if in_flight.is_empty() {
                if all_settled {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }

            in_flight.next().await;
        }
    }

    /// `(insertion order, ready ids, "nothing left pending/ready/running")`.
    async fn ready_snapshot(&self, plan_id: &str) -> (Vec<String>, HashSet<String>, bool) {
        let plans = self.plans.lock().await;
        let plan = plans.get(plan_id).expect("plan exists");
        let ready: HashSet<String> = plan.graph.ready(&plan.steps).into_iter().collect();
        let unsettled = plan.steps.values().any(|s| {
            matches!(s.status, StepStatus::Pending | StepStatus::Ready | StepStatus::Running | StepStatus::WaitingPermission)
        });
        (plan.order.clone(), ready, !unsettled)
    }

    async fn execute_one_step(
        &self,
        plan_id: &str,
        step_id: &str,
        token: &Arc<CancelToken>,
        now: &(impl Fn() -> u64 + Send + Sync),
    ) -> StepOutcome {
        let (tool_id, inputs, timeout, session_id, context_variables, risk_level, permissions, auto_approve, require_approval) = {
            let plans = self.plans.lock().await;
            let plan = plans.get(plan_id).expect("plan exists");
            let step = plan.steps.get(step_id).expect("step exists");
            let registry = self.tool_registry.read().await;
            let def = registry.lookup(&step.tool_id);
            (
                step.tool_id.clone(),
                step.inputs.clone(),
                step.timeout,
                plan.session_id.clone(),
                plan.context_variables.clone(),
                def.map_or(Default::default(), |d| d.risk_level),
                def.map_or_else(HashSet::new, |d| d.permissions.clone()),
                plan.config.auto_approve,
                plan.config.require_approval.clone(),
            )
        };

        let decision = self.permission_arbiter.check(
            PermissionCheckInput {
                session_id: &session_id,
                tool_id: &tool_id,
                risk_level,
                permissions: &permissions,
                auto_approve,
                require_approval: &require_approval,
            },
            now(),
        );

        match decision {
            Decision::Denied(_reason) => {
                self.set_step_status(plan_id, step_id, StepStatus::Skipped, now()).await;
                return StepOutcome::Continue;
            }
            Decision::Prompt => {
                self.set_step_status(plan_id, step_id, StepStatus::WaitingPermission, now()).await;
                // Resolution requires an external `UserConsent` collaborator
                // this engine does not own; without one, a prompted step is
                // skipped rather than left waiting forever.
                self.set_step_status(plan_id, step_id, StepStatus::Skipped, now()).await;
                return StepOutcome::Continue;
            }
            Decision::Granted => {}
        }

        let started_at = now();
        self.mark_running(plan_id, step_id, started_at).await;
        self.publish(plan_id, EventPayload::StepStarted { plan_id: plan_id.to_string(), step_id: step_id.to_string() }, started_at);

        let ctx = ToolContext::new(session_id, format!("{plan_id}:{step_id}")).with_context_variables(context_variables);
        let registry = self.tool_registry.read().await;
        let invocation = registry.invoke(&tool_id, inputs, &ctx);

        let result = tokio::select! {
            () = token.cancelled() => Err(EngineError::Cancelled),
            () = tokio::time::sleep(timeout) => Err(EngineError::StepTimeout { step: step_id.to_string() }),
            result = invocation => result,
        };
        drop(registry);

        let finished_at = now();

        match result {
            Ok(outcome) if !outcome.is_error => {
                let side_effects = outcome.side_effects.clone().unwrap_or_default();
                self.complete_step(plan_id, step_id, outcome, finished_at).await;
                if !side_effects.is_empty() {
                    let mut stacks = self.rollback_stacks.lock().await;
                    if let Some(stack) = stacks.get_mut(plan_id) {
                        stack.push(step_id, side_effects);
                    }
                }
                self.publish(plan_id, EventPayload::StepCompleted { plan_id: plan_id.to_string(), step_id: step_id.to_string() }, finished_at);
                StepOutcome::Continue
            }
            Ok(outcome) => self.handle_step_failure(plan_id, step_id, outcome.error.unwrap_or_default(), true, finished_at).await,
            Err(err) => {
                let recoverable = err.is_recoverable();
                self.handle_step_failure(plan_id, step_id, err.to_string(), recoverable, finished_at).await
            }
        }
    }

    async fn handle_step_failure(
        &self,
        plan_id: &str,
        step_id: &str,
        reason: String,
        recoverable: bool,
        now: u64,
    ) -> StepOutcome {
        let (can_retry, backoff) = {
            let mut plans = self.plans.lock().await;
            let plan = plans.get_mut(plan_id).expect("plan exists");
            let retry_failed = plan.config.retry_failed;
            let retry_base = plan.config.retry_base;
            let retry_multiplier = plan.config.retry_multiplier;
            let retry_max_backoff = plan.config.retry_max_backoff;
            let step = plan.steps.get_mut(step_id).expect("step exists");
            let can_retry = recoverable && retry_failed && step.can_retry();
            if can_retry {
                step.retry_count += 1;
                plan.metrics.retries += 1;
            }
            let backoff = exponential_backoff(retry_base, retry_multiplier, retry_max_backoff, step.retry_count);
            (can_retry, backoff)
        };

        self.publish(plan_id, EventPayload::StepFailed { plan_id: plan_id.to_string(), step_id: step_id.to_string(), reason }, now);

        if can_retry {
            tokio::time::sleep(backoff).await;
            self.set_step_status(plan_id, step_id, StepStatus::Pending, now).await;
            return StepOutcome::Continue;
        }

        self.fail_step(plan_id, step_id, now).await;

        let is_sequential = self.plans.lock().await.get(plan_id).map(|p| p.mode == SchedulingMode::Sequential).unwrap_or(false);
        if is_sequential {
            StepOutcome::AbortPlan
        } else {
            StepOutcome::Continue
        }
    }

    async fn mark_running(&self, plan_id: &str, step_id: &str, now: u64) {
        let mut plans = self.plans.lock().await;
        if let Some(step) = plans.get_mut(plan_id).and_then(|p| p.steps.get_mut(step_id)) {
            step.status = StepStatus::Running;
            step.started_at = Some(now);
        }
    }

    async fn complete_step(&self, plan_id: &str, step_id: &str, outcome: crate::tool::ToolResult, now: u64) {
        let mut plans = self.plans.lock().await;
        if let Some(plan) = plans.get_mut(plan_id) {
            if let Some(step) = plan.steps.get_mut(step_id) {
                step.status = StepStatus::Completed;
                step.completed_at = Some(now);
                step.result = Some(outcome);
            }
            plan.metrics.completed_steps += 1;
        }
    }

    async fn fail_step(&self, plan_id: &str, step_id: &str, now: u64) {
        let mut plans = self.plans.lock().await;
        if let Some(plan) = plans.get_mut(plan_id) {
            if let Some(step) = plan.steps.get_mut(step_id) {
                step.status = StepStatus::Failed;
                step.completed_at = Some(now);
            }
            plan.metrics.failed_steps += 1;
        }
    }

    async fn set_step_status(&self, plan_id: &str, step_id: &str, status: StepStatus, now: u64) {
        let mut plans = self.plans.lock().await;
        if let Some(plan) = plans.get_mut(plan_id) {
            if let Some(step) = plan.steps.get_mut(step_id) {
                step.status = status;
                if status == StepStatus::Skipped {
                    step.completed_at = Some(now);
                    plan.metrics.skipped_steps += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Continue,
    AbortPlan,
}

const fn is_terminal(status: PlanStatus) -> bool {
    matches!(
        status,
        PlanStatus::Completed | PlanStatus::Failed | PlanStatus::RolledBack | PlanStatus::Cancelled
    )
}

fn exponential_backoff(base: Duration, multiplier: f64, max: Duration, retry_count: u32) -> Duration {
    let scaled = base.as_secs_f64() * multiplier.powi(retry_count as i32);
    Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolContext as Ctx, ToolDefinition, ToolError, ToolHandler, ToolResult};
    use async_trait::async_trait;

    struct Succeeds;

    #[async_trait]
    impl ToolHandler for Succeeds {
        async fn call(&self, _args: Value, _ctx: &Ctx) -> crate::error::Result<ToolResult, ToolError> {
            Ok(ToolResult::ok("done"))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl ToolHandler for AlwaysFails {
        async fn call(&self, _args: Value, _ctx: &Ctx) -> crate::error::Result<ToolResult, ToolError> {
            Err(ToolError::ExecutionError("boom".into()))
        }
    }

    fn engine_with(tools: Vec<ToolDefinition>) -> ExecutionPlanEngine {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        ExecutionPlanEngine::new(
            Arc::new(tokio::sync::RwLock::new(registry)),
            Arc::new(PermissionArbiter::new()),
            Arc::new(EventBus::new(64)),
        )
    }

    fn noop_tool(name: &str) -> ToolDefinition {
        ToolDefinition::new(name, "noop", serde_json::json!({"type": "object"})).with_handler(Arc::new(Succeeds))
    }

    #[tokio::test]
    async fn linear_dependency_runs_in_order_and_completes() {
        let engine = engine_with(vec![noop_tool("t")]);
        let steps = vec![
            ExecutionStep::new("a", "p1", "t", Value::Null),
            ExecutionStep::new("b", "p1", "t", Value::Null).with_dependencies(vec!["a".into()]),
            ExecutionStep::new("c", "p1", "t", Value::Null).with_dependencies(vec!["b".into()]),
        ];
        engine
            .create_plan("p1", "s1", steps, SchedulingMode::Adaptive, PlanConfig { max_parallel: 8, ..PlanConfig::default() }, HashMap::new(), 0)
            .await
            .unwrap();

        let status = engine.execute("p1", || 0).await.unwrap();
        assert_eq!(status, PlanStatus::Completed);

        let plan = engine.get_plan("p1").await.unwrap();
        assert_eq!(plan.metrics.completed_steps, 3);
    }

    #[tokio::test]
    async fn parallel_fan_out_completes_all_branches() {
        let engine = engine_with(vec![noop_tool("t")]);
        let steps = vec![
            ExecutionStep::new("root", "p1", "t", Value::Null),
            ExecutionStep::new("x", "p1", "t", Value::Null).with_dependencies(vec!["root".into()]),
            ExecutionStep::new("y", "p1", "t", Value::Null).with_dependencies(vec!["root".into()]),
            ExecutionStep::new("z", "p1", "t", Value::Null).with_dependencies(vec!["root".into()]),
        ];
        engine
            .create_plan("p1", "s1", steps, SchedulingMode::Parallel, PlanConfig { max_parallel: 3, ..PlanConfig::default() }, HashMap::new(), 0)
            .await
            .unwrap();

        let status = engine.execute("p1", || 0).await.unwrap();
        assert_eq!(status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn sequential_mode_aborts_plan_on_first_failure_without_retry() {
        let mut registry = ToolRegistry::new();
        registry.register(noop_tool("good")).unwrap();
        registry
            .register(ToolDefinition::new("bad", "fails", serde_json::json!({"type": "object"})).with_handler(Arc::new(AlwaysFails)))
            .unwrap();
        let engine = ExecutionPlanEngine::new(Arc::new(tokio::sync::RwLock::new(registry)), Arc::new(PermissionArbiter::new()), Arc::new(EventBus::new(64)));

        let steps = vec![
            ExecutionStep::new("a", "p1", "bad", Value::Null),
            ExecutionStep::new("b", "p1", "good", Value::Null).with_dependencies(vec!["a".into()]),
        ];
        engine
            .create_plan("p1", "s1", steps, SchedulingMode::Sequential, PlanConfig { retry_failed: false, ..PlanConfig::default() }, HashMap::new(), 0)
            .await
            .unwrap();

        let status = engine.execute("p1", || 0).await.unwrap();
        assert_eq!(status, PlanStatus::Failed);

        let plan = engine.get_plan("p1").await.unwrap();
        assert_eq!(plan.step("b").unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn rollback_on_failure_unwinds_completed_steps() {
        struct WritesFile;
        #[async_trait]
        impl ToolHandler for WritesFile {
            async fn call(&self, _args: Value, _ctx: &Ctx) -> crate::error::Result<ToolResult, ToolError> {
                Ok(ToolResult::ok("wrote").with_context_update(HashMap::new()))
            }
        }

        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::new("write", "writes", serde_json::json!({"type": "object"}))
                    .with_handler(Arc::new(WritesFile)),
            )
            .unwrap();
        registry
            .register(ToolDefinition::new("bad", "fails", serde_json::json!({"type": "object"})).with_handler(Arc::new(AlwaysFails)))
            .unwrap();
        let engine = ExecutionPlanEngine::new(Arc::new(tokio::sync::RwLock::new(registry)), Arc::new(PermissionArbiter::new()), Arc::new(EventBus::new(64)));

        let steps = vec![
            ExecutionStep::new("a", "p1", "write", Value::Null),
            ExecutionStep::new("b", "p1", "bad", Value::Null).with_dependencies(vec!["a".into()]),
        ];
        engine
            .create_plan(
                "p1",
                "s1",
                steps,
                SchedulingMode::Sequential,
                PlanConfig { retry_failed: false, rollback_on_failure: true, ..PlanConfig::default() },
                HashMap::new(),
                0,
            )
            .await
            .unwrap();

        let status = engine.execute("p1", || 0).await.unwrap();
        assert_eq!(status, PlanStatus::RolledBack);

        let plan = engine.get_plan("p1").await.unwrap();
        assert_eq!(plan.metrics.rollback_count, 1);
    }

    #[tokio::test]
    async fn create_plan_rejects_a_cyclic_dependency_and_attempts_no_execution() {
        let engine = engine_with(vec![noop_tool("t")]);
        let steps = vec![
            ExecutionStep::new("a", "p1", "t", Value::Null).with_dependencies(vec!["b".into()]),
            ExecutionStep::new("b", "p1", "t", Value::Null).with_dependencies(vec!["a".into()]),
        ];

        let err = engine.create_plan("p1", "s1", steps, SchedulingMode::Adaptive, PlanConfig::default(), HashMap::new(), 0).await.unwrap_err();
        match err {
            EngineError::InvalidPlan(msg) => assert!(msg.contains("cycle"), "unexpected message: {msg}"),
            other => panic!("expected InvalidPlan, got {other:?}"),
        }

        assert!(engine.get_plan("p1").await.is_none());
    }

    #[tokio::test]
    async fn a_step_s_tool_context_carries_the_plan_s_context_variables() {
        struct CapturesContext {
            seen: std::sync::Mutex<Option<HashMap<String, Value>>>,
        }

        #[async_trait]
        impl ToolHandler for CapturesContext {
            async fn call(&self, _args: Value, ctx: &Ctx) -> crate::error::Result<ToolResult, ToolError> {
                *self.seen.lock().unwrap() = Some(ctx.context_variables.clone());
                Ok(ToolResult::ok("done"))
            }
        }

        let handler = Arc::new(CapturesContext { seen: std::sync::Mutex::new(None) });
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDefinition::new("capture", "captures context", serde_json::json!({"type": "object"})).with_handler(handler.clone()))
            .unwrap();
        let engine = ExecutionPlanEngine::new(Arc::new(tokio::sync::RwLock::new(registry)), Arc::new(PermissionArbiter::new()), Arc::new(EventBus::new(64)));

        let mut context_variables = HashMap::new();
        context_variables.insert("workingDirectory".to_string(), Value::String("/tmp/project".into()));

        let steps = vec![ExecutionStep::new("a", "p1", "capture", Value::Null)];
        engine
            .create_plan("p1", "s1", steps, SchedulingMode::Adaptive, PlanConfig::default(), context_variables.clone(), 0)
            .await
            .unwrap();

        engine.execute("p1", || 0).await.unwrap();

        let seen = handler.seen.lock().unwrap().clone().expect("handler was called");
        assert_eq!(seen, context_variables);
    }

    #[tokio::test]
    async fn step_retries_once_on_recoverable_failure_then_completes() {
        struct FailsOnceThenSucceeds {
            calls: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl ToolHandler for FailsOnceThenSucceeds {
            async fn call(&self, _args: Value, _ctx: &Ctx) -> crate::error::Result<ToolResult, ToolError> {
                if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    Err(ToolError::ExecutionError("transient".into()))
                } else {
                    Ok(ToolResult::ok("done"))
                }
            }
        }

        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::new("flaky", "fails once", serde_json::json!({"type": "object"}))
                    .with_handler(Arc::new(FailsOnceThenSucceeds { calls: std::sync::atomic::AtomicUsize::new(0) })),
            )
            .unwrap();
        let engine = ExecutionPlanEngine::new(Arc::new(tokio::sync::RwLock::new(registry)), Arc::new(PermissionArbiter::new()), Arc::new(EventBus::new(64)));

        let steps = vec![ExecutionStep::new("a", "p1", "flaky", Value::Null).with_max_retries(1)];
        engine
            .create_plan(
                "p1",
                "s1",
                steps,
                SchedulingMode::Adaptive,
                PlanConfig { retry_failed: true, retry_base: Duration::from_millis(1), ..PlanConfig::default() },
                HashMap::new(),
                0,
            )
            .await
            .unwrap();

        let status = engine.execute("p1", || 0).await.unwrap();
        assert_eq!(status, PlanStatus::Completed);

        let plan = engine.get_plan("p1").await.unwrap();
        let step = plan.step("a").unwrap();
        assert_eq!(step.retry_count, 1);
        assert_eq!(step.status, StepStatus::Completed);
    }

    #[test]
    fn from_env_overrides_max_parallel_and_leaves_require_approval_empty() {
        use crate::provider::FromEnv;

        // SAFETY: test-only, no other thread in this process reads this key.
        unsafe { std::env::set_var("CRUCIBLE_PLAN_MAX_PARALLEL", "16") };
        let config = PlanConfig::from_env();
        unsafe { std::env::remove_var("CRUCIBLE_PLAN_MAX_PARALLEL") };

        assert_eq!(config.max_parallel, 16);
        assert!(config.require_approval.is_empty());
    }
}
