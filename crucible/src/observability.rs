//! Observability: aggregate metrics derived from the Event Bus, plus
//! snapshot types joining a run's, a plan's, and a worker's counters into
//! one structured view suitable for a dashboard or a log line.
//!
//! Grounded in [`crate::usage::UsageTracker`]'s accumulate-then-snapshot
//! shape, generalized from token counts onto turns, tool calls, and
//! handoffs, and in [`crate::events::EventSink`] for the event-tally side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::events::{Event, EventPayload, EventSink};
use crate::plan::{ExecutionPlanEngine, PlanMetrics};
use crate::swarm::{Swarm, WorkerHealth, WorkerMetrics};
use crate::usage::{Usage, UsageTracker};

/// Running totals for one session's turns, kept up to date as a
/// [`crate::loop_::ConversationLoop`] run progresses.
#[derive(Debug, Clone, Default)]
pub struct RunMetrics {
    /// Provider turns taken so far.
    pub turns: u64,
    /// Tool calls dispatched so far.
    pub tool_calls: u64,
    /// Of those, how many ended in error.
    pub tool_errors: u64,
    /// Handoffs that occurred so far.
    pub handoffs: u64,
    usage: UsageTracker,
}

impl RunMetrics {
    /// Record one provider turn.
    pub fn record_turn(&mut self) {
        self.turns += 1;
    }

    /// Record one tool call's outcome.
    pub fn record_tool_call(&mut self, is_error: bool) {
        self.tool_calls += 1;
        if is_error {
            self.tool_errors += 1;
        }
    }

    /// Record one handoff.
    pub fn record_handoff(&mut self) {
        self.handoffs += 1;
    }

    /// Fold in token usage from a provider response.
    pub fn record_usage(&mut self, usage: Usage) {
        self.usage.add(usage);
    }

    /// Token usage accumulated so far.
    #[must_use]
    pub fn total_usage(&self) -> Usage {
        self.usage.total()
    }
}

/// A point-in-time, serializable tally of events seen by a [`MetricsSink`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Total events observed.
    pub events_observed: u64,
    /// Total events dropped by the bus before this sink ever saw them.
    pub events_dropped: u64,
    /// Per-kind event counts.
    pub events_by_kind: HashMap<String, u64>,
}

/// An [`EventSink`] that tallies events by kind, feeding [`EngineSnapshot`].
#[derive(Debug, Default)]
pub struct MetricsSink {
    observed: AtomicU64,
    by_kind: std::sync::Mutex<HashMap<String, u64>>,
}

impl MetricsSink {
    /// A sink with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of counts observed so far. `dropped` should come from the
    /// owning [`crate::events::EventBus::dropped`], since this sink only
    /// ever sees events that were actually delivered.
    #[must_use]
    pub fn snapshot(&self, dropped: u64) -> EngineSnapshot {
        EngineSnapshot {
            events_observed: self.observed.load(Ordering::Relaxed),
            events_dropped: dropped,
            events_by_kind: self.by_kind.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone(),
        }
    }
}

impl EventSink for MetricsSink {
    fn on_event(&self, event: &Event) {
        self.observed.fetch_add(1, Ordering::Relaxed);
        let mut by_kind = self.by_kind.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *by_kind.entry(event_kind(&event.payload).to_string()).or_insert(0) += 1;
    }
}

const fn event_kind(payload: &EventPayload) -> &'static str {
    match payload {
        EventPayload::SessionCreated { .. } => "session_created",
        EventPayload::TurnStart { .. } => "turn_start",
        EventPayload::TurnEnd { .. } => "turn_end",
        EventPayload::PlanCreated { .. } => "plan_created",
        EventPayload::PlanStarted { .. } => "plan_started",
        EventPayload::PlanCompleted { .. } => "plan_completed",
        EventPayload::PlanFailed { .. } => "plan_failed",
        EventPayload::StepStarted { .. } => "step_started",
        EventPayload::StepCompleted { .. } => "step_completed",
        EventPayload::StepFailed { .. } => "step_failed",
        EventPayload::PermissionRequested { .. } => "permission_requested",
        EventPayload::PermissionGranted { .. } => "permission_granted",
        EventPayload::WorkerRegistered { .. } => "worker_registered",
        EventPayload::WorkerUnregistered { .. } => "worker_unregistered",
        EventPayload::Handoff { .. } => "handoff",
        EventPayload::CircuitOpened { .. } => "circuit_opened",
        EventPayload::CircuitClosed { .. } => "circuit_closed",
        EventPayload::RollbackStarted { .. } => "rollback_started",
        EventPayload::RollbackCompleted { .. } => "rollback_completed",
    }
}

/// A combined view of one worker's health and accumulated metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerObservation {
    /// Current health snapshot.
    pub health: WorkerHealth,
    /// Accumulated dispatch/handoff counters.
    pub metrics: WorkerMetrics,
}

/// Join a worker's health and metrics from the pool, if it is registered.
#[must_use]
pub fn observe_worker(swarm: &Swarm, worker_id: &str) -> Option<WorkerObservation> {
    Some(WorkerObservation {
        health: swarm.health_of(worker_id)?,
        metrics: swarm.metrics_of(worker_id).unwrap_or_default(),
    })
}

/// A combined view of one plan's lifecycle status and step counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanObservation {
    /// Plan id.
    pub plan_id: String,
    /// Current status, rendered for display.
    pub status: String,
    /// Step-outcome counters.
    pub metrics: PlanMetrics,
}

/// Join a plan's status and metrics, if it is known to `engine`.
pub async fn observe_plan(engine: &ExecutionPlanEngine, plan_id: &str) -> Option<PlanObservation> {
    let plan = engine.get_plan(plan_id).await?;
    Some(PlanObservation {
        plan_id: plan.id.clone(),
        status: format!("{:?}", plan.status),
        metrics: plan.metrics,
    })
}

/// Render a Prometheus text-exposition snapshot covering every worker in
/// `swarm` and every plan named in `plan_ids`, plus the event-bus tallies in
/// `engine_snapshot`.
///
/// Grounded in the `# HELP`/`# TYPE`/`metric{label="value"} value` text
/// format used by every Prometheus client library; this crate hand-renders
/// it rather than pulling in a metrics-registry crate, since the values
/// already live in [`Swarm`] and [`ExecutionPlanEngine`] and a registry
/// would just duplicate that bookkeeping.
pub async fn metrics_text(swarm: &Swarm, engine: &ExecutionPlanEngine, plan_ids: &[String], engine_snapshot: &EngineSnapshot) -> String {
    let mut out = String::new();

    out.push_str("# HELP crucible_worker_healthy Whether the worker is currently considered usable (1) or not (0).\n");
    out.push_str("# TYPE crucible_worker_healthy gauge\n");
    out.push_str("# HELP crucible_worker_dispatches_total Dispatches attempted against this worker.\n");
    out.push_str("# TYPE crucible_worker_dispatches_total counter\n");
    out.push_str("# HELP crucible_worker_failures_total Dispatches against this worker that failed.\n");
    out.push_str("# TYPE crucible_worker_failures_total counter\n");
    out.push_str("# HELP crucible_worker_handoffs_received_total Handoffs this worker received.\n");
    out.push_str("# TYPE crucible_worker_handoffs_received_total counter\n");
    out.push_str("# HELP crucible_worker_handoffs_sent_total Handoffs this worker initiated.\n");
    out.push_str("# TYPE crucible_worker_handoffs_sent_total counter\n");
    for worker_id in swarm.worker_ids() {
        let Some(observation) = observe_worker(swarm, &worker_id) else { continue };
        out.push_str(&format!(
            "crucible_worker_healthy{{worker=\"{worker_id}\"}} {}\n",
            u8::from(observation.health.healthy)
        ));
        out.push_str(&format!("crucible_worker_dispatches_total{{worker=\"{worker_id}\"}} {}\n", observation.metrics.dispatches));
        out.push_str(&format!("crucible_worker_failures_total{{worker=\"{worker_id}\"}} {}\n", observation.metrics.failures));
        out.push_str(&format!(
            "crucible_worker_handoffs_received_total{{worker=\"{worker_id}\"}} {}\n",
            observation.metrics.handoffs_received
        ));
        out.push_str(&format!(
            "crucible_worker_handoffs_sent_total{{worker=\"{worker_id}\"}} {}\n",
            observation.metrics.handoffs_sent
        ));
    }

    out.push_str("# HELP crucible_plan_steps_total Total steps in the plan.\n");
    out.push_str("# TYPE crucible_plan_steps_total gauge\n");
    out.push_str("# HELP crucible_plan_steps_completed_total Steps that reached Completed.\n");
    out.push_str("# TYPE crucible_plan_steps_completed_total counter\n");
    out.push_str("# HELP crucible_plan_steps_failed_total Steps that reached Failed.\n");
    out.push_str("# TYPE crucible_plan_steps_failed_total counter\n");
    out.push_str("# HELP crucible_plan_retries_total Retry attempts made across all steps.\n");
    out.push_str("# TYPE crucible_plan_retries_total counter\n");
    for plan_id in plan_ids {
        let Some(observation) = observe_plan(engine, plan_id).await else { continue };
        out.push_str(&format!("crucible_plan_steps_total{{plan=\"{plan_id}\"}} {}\n", observation.metrics.total_steps));
        out.push_str(&format!("crucible_plan_steps_completed_total{{plan=\"{plan_id}\"}} {}\n", observation.metrics.completed_steps));
        out.push_str(&format!("crucible_plan_steps_failed_total{{plan=\"{plan_id}\"}} {}\n", observation.metrics.failed_steps));
        out.push_str(&format!("crucible_plan_retries_total{{plan=\"{plan_id}\"}} {}\n", observation.metrics.retries));
    }

    out.push_str("# HELP crucible_events_observed_total Events delivered to the metrics sink.\n");
    out.push_str("# TYPE crucible_events_observed_total counter\n");
    out.push_str(&format!("crucible_events_observed_total {}\n", engine_snapshot.events_observed));
    out.push_str("# HELP crucible_events_dropped_total Events dropped by the bus before any sink saw them.\n");
    out.push_str("# TYPE crucible_events_dropped_total counter\n");
    out.push_str(&format!("crucible_events_dropped_total {}\n", engine_snapshot.events_dropped));
    out.push_str("# HELP crucible_events_by_kind_total Events delivered, by kind.\n");
    out.push_str("# TYPE crucible_events_by_kind_total counter\n");
    let mut kinds: Vec<_> = engine_snapshot.events_by_kind.iter().collect();
    kinds.sort_by_key(|(kind, _)| kind.as_str());
    for (kind, count) in kinds {
        out.push_str(&format!("crucible_events_by_kind_total{{kind=\"{kind}\"}} {count}\n"));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_metrics_accumulates_usage_and_counters() {
        let mut metrics = RunMetrics::default();
        metrics.record_turn();
        metrics.record_tool_call(false);
        metrics.record_tool_call(true);
        metrics.record_handoff();
        metrics.record_usage(Usage::new(10, 5));
        metrics.record_usage(Usage::new(20, 10));

        assert_eq!(metrics.turns, 1);
        assert_eq!(metrics.tool_calls, 2);
        assert_eq!(metrics.tool_errors, 1);
        assert_eq!(metrics.handoffs, 1);
        assert_eq!(metrics.total_usage().total_tokens, 45);
    }

    #[tokio::test]
    async fn metrics_text_renders_worker_and_event_lines() {
        let event_bus = std::sync::Arc::new(crate::events::EventBus::new(16));
        let swarm = Swarm::new(crate::swarm::DispatchStrategy::LeastLoaded, None, event_bus.clone());
        swarm
            .register(
                crate::swarm::WorkerConfig::new("leader", "Leader", "you lead"),
                crate::circuit::CircuitBreakerConfig::default(),
                0,
            )
            .unwrap();

        let tool_registry = std::sync::Arc::new(tokio::sync::RwLock::new(crate::tool::ToolRegistry::new()));
        let permission_arbiter = std::sync::Arc::new(crate::permission::PermissionArbiter::new());
        let engine = ExecutionPlanEngine::new(tool_registry, permission_arbiter, event_bus);

        let sink = MetricsSink::new();
        sink.on_event(&Event::new(0, "c1".into(), EventPayload::SessionCreated { session_id: "s1".into() }));
        let snapshot = sink.snapshot(0);

        let text = metrics_text(&swarm, &engine, &[], &snapshot).await;
        assert!(text.contains("crucible_worker_healthy{worker=\"leader\"} 1"));
        assert!(text.contains("crucible_events_observed_total 1"));
        assert!(text.contains("crucible_events_by_kind_total{kind=\"session_created\"} 1"));
    }

    #[test]
    fn metrics_sink_tallies_by_kind() {
        let sink = MetricsSink::new();
        sink.on_event(&Event::new(0, "c1".into(), EventPayload::TurnStart { session_id: "s1".into() }));
        sink.on_event(&Event::new(0, "c1".into(), EventPayload::TurnStart { session_id: "s1".into() }));
        sink.on_event(&Event::new(0, "c1".into(), EventPayload::TurnEnd { session_id: "s1".into() }));

        let snapshot = sink.snapshot(3);
        assert_eq!(snapshot.events_observed, 3);
        assert_eq!(snapshot.events_dropped, 3);
        assert_eq!(snapshot.events_by_kind.get("turn_start"), Some(&2));
        assert_eq!(snapshot.events_by_kind.get("turn_end"), Some(&1));
    }
}
