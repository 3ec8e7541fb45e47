//! Engine Facade: the single entry point that binds a provider, tool
//! registry, permission arbiter, worker pool, plan engine, and session store
//! into one handle an embedding application talks to.
//!
//! Grounded in the same bind-everything-at-construction, expose-a-handful-
//! of-methods shape the teacher's top-level runner uses to wire a model
//! client, tools, and hooks together, generalized here onto a pool of
//! workers and a session store instead of a single agent.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::circuit::CircuitBreakerConfig;
use crate::context::ContextVariables;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus, EventPayload, EventSink};
use crate::loop_::{CancelHandle, ConversationLoop, LoopConfig, RunOptions, RunOutcome, StreamEvent};
use crate::message::Message;
use crate::permission::PermissionArbiter;
use crate::plan::ExecutionPlanEngine;
use crate::provider::Provider;
use crate::session::{Session, SessionSnapshot};
use crate::swarm::{DispatchStrategy, Swarm, WorkerConfig};
use crate::tool::ToolDefinition;

/// Tunables for an [`EngineFacade`], independent of any one session's
/// [`LoopConfig`].
#[derive(Debug, Clone, Copy)]
pub struct FacadeConfig {
    /// Capacity of the shared event bus.
    pub event_bus_capacity: usize,
    /// Worker dispatch strategy used by the pool.
    pub dispatch_strategy: DispatchStrategy,
    /// Default per-session loop configuration.
    pub loop_config: LoopConfig,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            event_bus_capacity: 1024,
            dispatch_strategy: DispatchStrategy::LeastLoaded,
            loop_config: LoopConfig::default(),
        }
    }
}

/// How often and after how long of silence the background health probe
/// demotes a worker it hasn't heard a health check from.
#[derive(Debug, Clone, Copy)]
pub struct HealthProbeConfig {
    /// Interval between `Swarm::demote_stale` sweeps.
    pub interval: std::time::Duration,
    /// How long, in milliseconds of the facade's own `now` clock, a worker
    /// may go unchecked before it is demoted.
    pub stale_after_ms: u64,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self { interval: std::time::Duration::from_secs(30), stale_after_ms: 120_000 }
    }
}

impl crate::provider::FromEnv for FacadeConfig {
    /// Reads `CRUCIBLE_EVENT_BUS_CAPACITY`, `CRUCIBLE_DISPATCH_STRATEGY`
    /// (`round_robin`/`least_loaded`/`capability_match`/`adaptive`), and
    /// defers to [`LoopConfig::from_env`] for `loop_config`.
    fn from_env() -> Self {
        let default = Self::default();
        let dispatch_strategy = std::env::var("CRUCIBLE_DISPATCH_STRATEGY").ok().map_or(default.dispatch_strategy, |value| {
            match value.to_ascii_lowercase().as_str() {
                "round_robin" => DispatchStrategy::RoundRobin,
                "capability_match" => DispatchStrategy::CapabilityMatch,
                "adaptive" => DispatchStrategy::Adaptive,
                _ => DispatchStrategy::LeastLoaded,
            }
        });
        Self {
            event_bus_capacity: crate::provider::env_or("CRUCIBLE_EVENT_BUS_CAPACITY", default.event_bus_capacity),
            dispatch_strategy,
            loop_config: <LoopConfig as crate::provider::FromEnv>::from_env(),
        }
    }
}

impl crate::provider::FromEnv for HealthProbeConfig {
    /// Reads `CRUCIBLE_HEALTH_PROBE_INTERVAL_MS` and
    /// `CRUCIBLE_HEALTH_PROBE_STALE_AFTER_MS`.
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            interval: std::time::Duration::from_millis(crate::provider::env_or(
                "CRUCIBLE_HEALTH_PROBE_INTERVAL_MS",
                u64::try_from(default.interval.as_millis()).unwrap_or(u64::MAX),
            )),
            stale_after_ms: crate::provider::env_or("CRUCIBLE_HEALTH_PROBE_STALE_AFTER_MS", default.stale_after_ms),
        }
    }
}

/// The orchestration engine's single entry point: owns the provider, tool
/// registry, permission arbiter, worker pool, plan engine, and every live
/// session, and drives sessions through the Conversation Loop.
///
/// Can only be constructed through [`EngineFacadeBuilder::try_build`], which
/// validates that the pool it is handed is actually usable before handing
/// back a live facade — the same validate-before-construct discipline
/// applied elsewhere in this crate to agent construction.
pub struct EngineFacade {
    tool_registry: Arc<RwLock<crate::tool::ToolRegistry>>,
    permission_arbiter: Arc<PermissionArbiter>,
    plan_engine: Arc<ExecutionPlanEngine>,
    swarm: Arc<Swarm>,
    event_bus: Arc<EventBus>,
    sessions: RwLock<HashMap<String, Session>>,
    conversation_loop: ConversationLoop,
    cancel_handles: RwLock<HashMap<String, CancelHandle>>,
    health_probe: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Builder for [`EngineFacade`], accumulating tools and workers before a
/// single validating [`EngineFacadeBuilder::try_build`] call.
pub struct EngineFacadeBuilder {
    provider: Arc<dyn Provider>,
    config: FacadeConfig,
    health_probe: HealthProbeConfig,
    tools: Vec<ToolDefinition>,
    workers: Vec<(WorkerConfig, CircuitBreakerConfig)>,
}

impl EngineFacadeBuilder {
    /// Start building a facade around `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            config: FacadeConfig::default(),
            health_probe: HealthProbeConfig::default(),
            tools: Vec::new(),
            workers: Vec::new(),
        }
    }

    /// Override the default [`FacadeConfig`].
    #[must_use]
    pub fn config(mut self, config: FacadeConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the default [`HealthProbeConfig`].
    #[must_use]
    pub fn health_probe(mut self, config: HealthProbeConfig) -> Self {
        self.health_probe = config;
        self
    }

    /// Queue a tool for registration at build time.
    #[must_use]
    pub fn tool(mut self, def: ToolDefinition) -> Self {
        self.tools.push(def);
        self
    }

    /// Queue a worker for registration at build time.
    #[must_use]
    pub fn worker(mut self, config: WorkerConfig, breaker_config: CircuitBreakerConfig) -> Self {
        self.workers.push((config, breaker_config));
        self
    }

    /// Validate and construct the facade, starting its background health
    /// probe task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] if no worker was queued, or if
    /// a queued worker's id collides with a queued tool's name.
    pub fn try_build(self, now: u64) -> Result<EngineFacade> {
        if self.workers.is_empty() {
            return Err(EngineError::InvalidState("a facade requires at least one registered worker".to_string()));
        }
        for (worker, _) in &self.workers {
            if self.tools.iter().any(|t| t.name == worker.id) {
                return Err(EngineError::InvalidState(format!(
                    "worker id '{}' collides with a registered tool name",
                    worker.id
                )));
            }
        }

        let event_bus = Arc::new(EventBus::new(self.config.event_bus_capacity));
        let mut tool_registry = crate::tool::ToolRegistry::new();
        for def in self.tools {
            tool_registry.register(def)?;
        }
        let tool_registry = Arc::new(RwLock::new(tool_registry));
        let permission_arbiter = Arc::new(PermissionArbiter::new());
        let plan_engine = Arc::new(ExecutionPlanEngine::new(
            tool_registry.clone(),
            permission_arbiter.clone(),
            event_bus.clone(),
        ));
        let swarm = Arc::new(Swarm::new(self.config.dispatch_strategy, None, event_bus.clone()));
        for (config, breaker_config) in self.workers {
            swarm.register(config, breaker_config, now)?;
        }
        let conversation_loop = ConversationLoop::new(
            self.provider,
            plan_engine.clone(),
            swarm.clone(),
            event_bus.clone(),
            self.config.loop_config,
        );

        let probe_swarm = swarm.clone();
        let probe_config = self.health_probe;
        let health_probe = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe_config.interval);
            loop {
                ticker.tick().await;
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
                probe_swarm.demote_stale(now, probe_config.stale_after_ms);
            }
        });

        Ok(EngineFacade {
            tool_registry,
            permission_arbiter,
            plan_engine,
            swarm,
            event_bus,
            sessions: RwLock::new(HashMap::new()),
            conversation_loop,
            cancel_handles: RwLock::new(HashMap::new()),
            health_probe: std::sync::Mutex::new(Some(health_probe)),
        })
    }
}

impl EngineFacade {
    /// Attach an [`EventSink`], e.g. [`crate::observability::MetricsSink`] or
    /// [`crate::events::TracingSink`].
    pub fn add_event_sink(&self, sink: Arc<dyn EventSink>) {
        self.event_bus.add_sink(sink);
    }

    /// Register a tool, available to any worker that lists it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateTool`] if a tool with the same name
    /// is already registered.
    pub async fn register_tool(&self, def: ToolDefinition) -> Result<()> {
        self.tool_registry.write().await.register(def)
    }

    /// Register a worker with the pool.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError::InvalidState`] if a worker with the same id
    /// is already registered.
    pub fn register_worker(&self, config: WorkerConfig, breaker_config: CircuitBreakerConfig, now: u64) -> Result<()> {
        self.swarm.register(config, breaker_config, now)
    }

    /// Create a new session owned by `default_worker_id`, tracked for
    /// `snapshot_session`/`shutdown`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HandoffTargetMissing`] if `default_worker_id`
    /// is not registered.
    pub async fn create_session(&self, id: impl Into<String>, default_worker_id: impl Into<String>, now: u64) -> Result<String> {
        let default_worker_id = default_worker_id.into();
        if !self.swarm.contains(&default_worker_id) {
            return Err(EngineError::HandoffTargetMissing(default_worker_id));
        }

        let session = Session::new(id, default_worker_id, now);
        let id = session.id.clone();
        self.event_bus
            .publish(Event::new(now, id.clone(), EventPayload::SessionCreated { session_id: id.clone() }));
        self.sessions.write().await.insert(id.clone(), session);
        self.cancel_handles.write().await.insert(id.clone(), CancelHandle::new());
        Ok(id)
    }

    /// Run `messages` against `session_id` to a final answer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] if `session_id` is unknown, or
    /// whatever [`ConversationLoop::run`] returns.
    pub async fn run(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        context_overrides: HashMap<String, Value>,
        now: impl Fn() -> u64 + Send + Sync + Copy,
    ) -> Result<RunOutcome> {
        let cancel = self.cancel_handle(session_id).await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::InvalidState(format!("unknown session '{session_id}'")))?;
        self.conversation_loop
            .run(session, messages, RunOptions { context_overrides }, &cancel, now)
            .await
    }

    /// As [`EngineFacade::run`], but forwards [`StreamEvent`]s as they occur.
    ///
    /// # Errors
    ///
    /// Same as [`EngineFacade::run`].
    pub async fn run_stream(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        context_overrides: HashMap<String, Value>,
        now: impl Fn() -> u64 + Send + Sync + Copy,
        sender: tokio::sync::mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<RunOutcome> {
        let cancel = self.cancel_handle(session_id).await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::InvalidState(format!("unknown session '{session_id}'")))?;
        self.conversation_loop
            .run_stream(session, messages, RunOptions { context_overrides }, &cancel, now, sender)
            .await
    }

    /// Cancel an in-flight `run`/`run_stream` for `session_id`. A no-op if
    /// the session has no run in progress.
    pub async fn cancel_run(&self, session_id: &str) {
        if let Some(handle) = self.cancel_handles.read().await.get(session_id) {
            handle.cancel();
        }
    }

    /// A lossless snapshot of `session_id`'s persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] if `session_id` is unknown.
    pub async fn snapshot_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(Session::snapshot)
            .ok_or_else(|| EngineError::InvalidState(format!("unknown session '{session_id}'")))
    }

    /// Restore a session from a snapshot, e.g. after a process restart.
    pub async fn restore_session(&self, snapshot: SessionSnapshot) {
        let session = Session::restore(snapshot);
        let id = session.id.clone();
        self.sessions.write().await.insert(id.clone(), session);
        self.cancel_handles.write().await.insert(id, CancelHandle::new());
    }

    /// Resolve a session's live context variables, e.g. for inspection
    /// between runs.
    pub async fn context_of(&self, session_id: &str) -> Option<ContextVariables> {
        self.sessions.read().await.get(session_id).map(|s| s.context_variables.clone())
    }

    /// Cancel every in-flight run, drop every tracked session, drain any
    /// events still buffered on the event bus, and join the background
    /// health-probe task.
    pub async fn shutdown(&self) {
        for handle in self.cancel_handles.read().await.values() {
            handle.cancel();
        }
        self.sessions.write().await.clear();
        self.cancel_handles.write().await.clear();

        let mut drain = self.event_bus.subscribe();
        while drain.try_recv().is_ok() {}

        let probe = self.health_probe.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(probe) = probe {
            probe.abort();
            let _ = probe.await;
        }
    }

    async fn cancel_handle(&self, session_id: &str) -> Result<CancelHandle> {
        self.cancel_handles
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidState(format!("unknown session '{session_id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use crate::tool::{ToolContext, ToolError, ToolHandler, ToolResult};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Value, _ctx: &ToolContext) -> std::result::Result<ToolResult, ToolError> {
            Ok(ToolResult::ok(args.to_string()))
        }
    }

    fn facade_with_leader(provider: MockProvider) -> EngineFacade {
        EngineFacadeBuilder::new(Arc::new(provider))
            .tool(ToolDefinition::new("echo", "echoes input", serde_json::json!({"type": "object"})).with_handler(Arc::new(Echo)))
            .worker(WorkerConfig::new("leader", "Leader", "you are the leader"), CircuitBreakerConfig::default())
            .try_build(0)
            .unwrap()
    }

    #[tokio::test]
    async fn run_against_an_unknown_session_is_invalid_state() {
        let facade = facade_with_leader(MockProvider::new(vec!["hi".into()]));
        let err = facade.run("ghost", vec![Message::user("m1", "hi", 0)], HashMap::new(), || 0).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn create_session_rejects_unknown_default_worker() {
        let facade = facade_with_leader(MockProvider::new(vec!["hi".into()]));
        let err = facade.create_session("s1", "ghost", 0).await.unwrap_err();
        assert!(matches!(err, EngineError::HandoffTargetMissing(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn run_produces_a_final_answer_and_snapshot_reflects_it() {
        let facade = facade_with_leader(MockProvider::new(vec!["hello there".into()]));
        facade.create_session("s1", "leader", 0).await.unwrap();

        let outcome = facade.run("s1", vec![Message::user("m1", "hi", 0)], HashMap::new(), || 0).await.unwrap();
        assert_eq!(outcome.message.text_content(), Some("hello there".to_string()));

        let snapshot = facade.snapshot_session("s1").await.unwrap();
        assert_eq!(snapshot.history.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_clears_sessions_and_joins_health_probe() {
        let facade = facade_with_leader(MockProvider::new(vec!["hi".into()]));
        facade.create_session("s1", "leader", 0).await.unwrap();
        facade.shutdown().await;
        assert!(matches!(facade.snapshot_session("s1").await, Err(EngineError::InvalidState(_))));
        assert!(facade.health_probe.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn try_build_rejects_zero_workers() {
        let err = EngineFacadeBuilder::new(Arc::new(MockProvider::new(vec!["hi".into()]))).try_build(0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn try_build_rejects_worker_id_colliding_with_tool_name() {
        let err = EngineFacadeBuilder::new(Arc::new(MockProvider::new(vec!["hi".into()])))
            .tool(ToolDefinition::new("leader", "not actually a worker", serde_json::json!({"type": "object"})).with_handler(Arc::new(Echo)))
            .worker(WorkerConfig::new("leader", "Leader", "you are the leader"), CircuitBreakerConfig::default())
            .try_build(0)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[test]
    fn from_env_overrides_dispatch_strategy() {
        use crate::provider::FromEnv;

        // SAFETY: test-only, no other thread in this process reads this key.
        unsafe { std::env::set_var("CRUCIBLE_DISPATCH_STRATEGY", "adaptive") };
        let config = FacadeConfig::from_env();
        unsafe { std::env::remove_var("CRUCIBLE_DISPATCH_STRATEGY") };

        assert_eq!(config.dispatch_strategy, DispatchStrategy::Adaptive);
        assert_eq!(config.event_bus_capacity, FacadeConfig::default().event_bus_capacity);
    }
}
