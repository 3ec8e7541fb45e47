//! Conversation Loop: drives a session through repeated provider calls, tool
//! execution via the Execution Plan Engine, and worker handoffs, until the
//! model produces a final answer or the turn budget runs out.
//!
//! Grounded in the bounded per-turn loop used elsewhere in this crate for
//! driving a single agent's steps, generalized here onto a pool of workers
//! (so a turn can switch which worker is driving mid-run) and onto the
//! Execution Plan Engine for tool dispatch (so a turn's tool calls get
//! dependency tracking, permission checks, and retries for free instead of
//! being invoked directly against the registry).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Notify;

use crate::context::ContextVariables;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus, EventPayload};
use crate::message::{Message, aggregate_stream_deltas};
use crate::plan::{ExecutionPlanEngine, ExecutionStep, PlanConfig, PlanStatus, SchedulingMode};
use crate::provider::{Provider, ProviderChunk, ProviderRequest};
use crate::session::Session;
use crate::swarm::Swarm;

/// Tunables for the Conversation Loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Maximum turns (provider call + tool round) before giving up.
    pub max_turns: usize,
    /// Wall-clock budget for a single provider call.
    pub turn_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { max_turns: 20, turn_timeout: Duration::from_secs(120) }
    }
}

impl crate::provider::FromEnv for LoopConfig {
    /// Reads `CRUCIBLE_LOOP_MAX_TURNS` and `CRUCIBLE_LOOP_TURN_TIMEOUT_MS`.
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_turns: crate::provider::env_or("CRUCIBLE_LOOP_MAX_TURNS", default.max_turns),
            turn_timeout: Duration::from_millis(crate::provider::env_or(
                "CRUCIBLE_LOOP_TURN_TIMEOUT_MS",
                u64::try_from(default.turn_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }
}

/// Per-call overrides layered onto a session's stored context for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Context-variable overrides for this run only; never written back to
    /// the session's own `context_variables`.
    pub context_overrides: HashMap<String, Value>,
}

/// Cooperative cancellation handle for an in-flight `run`/`run_stream`.
///
/// Mirrors the same atomic-bool-plus-`Notify` shape used for plan
/// cancellation, scoped here to one session's run instead of one plan.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    /// A fresh, unset handle.
    #[must_use]
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One update emitted while a streamed run is in progress.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// An incremental fragment of the active turn's assistant message.
    Delta(ProviderChunk),
    /// The loop produced a final answer; no further events follow.
    Final(Message),
}

/// The result of a completed `run`/`run_stream` call.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The model's final answer.
    pub message: Message,
    /// Number of turns (provider calls) taken to reach it.
    pub turns: usize,
}

/// Drives a session's turns: provider call, tool execution, handoff
/// resolution, repeated until a final answer or the turn budget is spent.
pub struct ConversationLoop {
    provider: Arc<dyn Provider>,
    plan_engine: Arc<ExecutionPlanEngine>,
    swarm: Arc<Swarm>,
    event_bus: Arc<EventBus>,
    config: LoopConfig,
}

impl ConversationLoop {
    /// Build a loop bound to the given collaborators.
    #[must_use]
    pub fn new(
        provider: Arc<dyn Provider>,
        plan_engine: Arc<ExecutionPlanEngine>,
        swarm: Arc<Swarm>,
        event_bus: Arc<EventBus>,
        config: LoopConfig,
    ) -> Self {
        Self { provider, plan_engine, swarm, event_bus, config }
    }

    /// Append `messages` to `session` and run turns until a final answer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cancelled`] if `cancel` fires mid-run,
    /// [`EngineError::Internal`] if the turn budget is exceeded or a turn
    /// times out, or any error a provider/tool call produces.
    pub async fn run(
        &self,
        session: &mut Session,
        messages: Vec<Message>,
        options: RunOptions,
        cancel: &CancelHandle,
        now: impl Fn() -> u64 + Send + Sync + Copy,
    ) -> Result<RunOutcome> {
        self.run_inner(session, messages, options, cancel, now, None).await
    }

    /// As [`ConversationLoop::run`], but forwards a [`StreamEvent::Delta`]
    /// for every chunk the provider streams back, and a final
    /// [`StreamEvent::Final`] once the loop produces its answer.
    ///
    /// # Errors
    ///
    /// Same as [`ConversationLoop::run`].
    pub async fn run_stream(
        &self,
        session: &mut Session,
        messages: Vec<Message>,
        options: RunOptions,
        cancel: &CancelHandle,
        now: impl Fn() -> u64 + Send + Sync + Copy,
        sender: tokio::sync::mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<RunOutcome> {
        let outcome = self.run_inner(session, messages, options, cancel, now, Some(&sender)).await;
        if let Ok(ref run_outcome) = outcome {
            let _ = sender.send(StreamEvent::Final(run_outcome.message.clone()));
        }
        outcome
    }

    async fn run_inner(
        &self,
        session: &mut Session,
        messages: Vec<Message>,
        options: RunOptions,
        cancel: &CancelHandle,
        now: impl Fn() -> u64 + Send + Sync + Copy,
        stream_sender: Option<&tokio::sync::mpsc::UnboundedSender<StreamEvent>>,
    ) -> Result<RunOutcome> {
        for message in messages {
            session.append(message, now());
        }

        let mut context = session.context_variables.merged_with(options.context_overrides);
        self.event_bus
            .publish(Event::new(now(), session.id.clone(), EventPayload::TurnStart { session_id: session.id.clone() }));

        let mut turns = 0usize;
        let result = loop {
            if cancel.is_cancelled() {
                break Err(EngineError::Cancelled);
            }
            if turns >= self.config.max_turns {
                break Err(EngineError::Internal(format!("exceeded max_turns ({})", self.config.max_turns)));
            }
            turns += 1;

            match self.run_one_turn(session, &mut context, cancel, now, stream_sender).await {
                Ok(Some(final_message)) => break Ok(final_message),
                Ok(None) => continue,
                Err(err) => break Err(err),
            }
        };

        session.context_variables = context;
        self.event_bus
            .publish(Event::new(now(), session.id.clone(), EventPayload::TurnEnd { session_id: session.id.clone() }));

        result.map(|message| RunOutcome { message, turns })
    }

    /// Run one provider call plus, if it requested tools, one round of tool
    /// execution. Returns `Some(message)` once a final answer is reached,
    /// `None` to continue looping.
    async fn run_one_turn(
        &self,
        session: &mut Session,
        context: &mut ContextVariables,
        cancel: &CancelHandle,
        now: impl Fn() -> u64 + Send + Sync + Copy,
        stream_sender: Option<&tokio::sync::mpsc::UnboundedSender<StreamEvent>>,
    ) -> Result<Option<Message>> {
        let worker_id = session.active_worker_id.clone();
        let worker = self
            .swarm
            .config_of(&worker_id)
            .ok_or_else(|| EngineError::HandoffTargetMissing(worker_id.clone()))?;

        let system_prompt = worker.resolve_instructions(context);
        let mut request_messages = vec![Message::system("system", system_prompt, now())];
        request_messages.extend(session.history().iter().cloned());
        let request = ProviderRequest::new(request_messages).with_tools(worker.tools.clone());

        let assistant_message = if let Some(sender) = stream_sender {
            self.complete_streamed(request, cancel, sender).await?
        } else {
            self.complete_once(request, cancel).await?
        };
        session.append(assistant_message.clone(), now());

        if !assistant_message.has_tool_calls() {
            return Ok(Some(assistant_message));
        }

        self.execute_tool_calls(session, context, &worker_id, &assistant_message, cancel, now)
            .await?;
        Ok(None)
    }

    async fn complete_once(&self, request: ProviderRequest, cancel: &CancelHandle) -> Result<Message> {
        tokio::select! {
            () = cancel.cancelled() => Err(EngineError::Cancelled),
            () = tokio::time::sleep(self.config.turn_timeout) => Err(EngineError::Internal("turn timed out".to_string())),
            result = self.provider.complete(request) => Ok(result?.message),
        }
    }

    async fn complete_streamed(
        &self,
        request: ProviderRequest,
        cancel: &CancelHandle,
        sender: &tokio::sync::mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<Message> {
        let stream_result = tokio::select! {
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            () = tokio::time::sleep(self.config.turn_timeout) => return Err(EngineError::Internal("turn timed out".to_string())),
            result = self.provider.complete_stream(request) => result,
        };
        let mut stream = stream_result?;

        let mut deltas = Vec::new();
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Err(EngineError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            let _ = sender.send(StreamEvent::Delta(chunk.clone()));
            deltas.push(crate::message::MessageStreamDelta {
                content: chunk.content,
                tool_calls: chunk.tool_calls.map(|calls| {
                    calls
                        .into_iter()
                        .enumerate()
                        .map(|(index, call)| crate::message::ToolCallStreamDelta {
                            index,
                            id: Some(call.id),
                            name: Some(call.name),
                            arguments_fragment: Some(call.arguments.to_string()),
                        })
                        .collect()
                }),
            });
        }

        Ok(aggregate_stream_deltas(uuid::Uuid::new_v4().to_string(), &deltas, 0))
    }

    async fn execute_tool_calls(
        &self,
        session: &mut Session,
        context: &mut ContextVariables,
        worker_id: &str,
        assistant_message: &Message,
        cancel: &CancelHandle,
        now: impl Fn() -> u64 + Send + Sync + Copy,
    ) -> Result<()> {
        let tool_calls = assistant_message.tool_calls.clone().unwrap_or_default();
        if tool_calls.is_empty() {
            return Ok(());
        }

        let plan_id = format!("{}-turn-{}", session.id, now());
        let steps: Vec<ExecutionStep> = tool_calls
            .iter()
            .map(|call| ExecutionStep::new(call.id.clone(), plan_id.clone(), call.name.clone(), call.arguments.clone()))
            .collect();

        self.plan_engine
            .create_plan(
                plan_id.clone(),
                session.id.clone(),
                steps,
                SchedulingMode::Parallel,
                PlanConfig::default(),
                context.snapshot(),
                now(),
            )
            .await?;
        session.record_plan(plan_id.clone());

        let status = tokio::select! {
            () = cancel.cancelled() => {
                self.plan_engine.cancel(&plan_id).await;
                return Err(EngineError::Cancelled);
            }
            result = self.plan_engine.execute(&plan_id, now) => result?,
        };

        let plan = self
            .plan_engine
            .get_plan(&plan_id)
            .await
            .ok_or_else(|| EngineError::Internal("plan vanished after execute".to_string()))?;

        let mut handoff_target = None;
        for call in &tool_calls {
            let Some(step) = plan.step(&call.id) else { continue };
            let (text, updates, handoff, is_error) = match &step.result {
                Some(result) => (
                    result.value.clone(),
                    result.updated_context_variables.clone(),
                    result.handoff_target.clone(),
                    result.is_error,
                ),
                None => (format!("step '{}' did not complete ({:?})", call.id, step.status), None, None, true),
            };

            session.append(
                Message::tool_result(format!("{}-result", call.id), call.id.clone(), call.name.clone(), text, now()),
                now(),
            );
            if let Some(updates) = updates {
                context.merge(updates);
            }
            if handoff.is_some() && !is_error {
                handoff_target = handoff;
            }
        }

        if let Some(target) = handoff_target {
            if target != worker_id {
                self.swarm.record_handoff(&session.id, worker_id, &target, now())?;
                session.set_active_worker(target, now());
            }
        }

        if status != PlanStatus::Completed {
            return Err(EngineError::Internal(format!("tool execution plan ended in {status:?}")));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBreakerConfig;
    use crate::permission::PermissionArbiter;
    use crate::provider::MockProvider;
    use crate::swarm::{DispatchStrategy, WorkerConfig};
    use crate::tool::{ToolContext, ToolDefinition, ToolError, ToolHandler, ToolRegistry, ToolResult};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Value, _ctx: &ToolContext) -> std::result::Result<ToolResult, ToolError> {
            Ok(ToolResult::ok(args.to_string()))
        }
    }

    fn loop_with(provider: MockProvider) -> (ConversationLoop, Arc<Swarm>) {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDefinition::new("echo", "echoes input", serde_json::json!({"type": "object"})).with_handler(Arc::new(Echo)))
            .unwrap();

        let event_bus = Arc::new(EventBus::new(64));
        let plan_engine = Arc::new(ExecutionPlanEngine::new(
            Arc::new(tokio::sync::RwLock::new(registry)),
            Arc::new(PermissionArbiter::new()),
            event_bus.clone(),
        ));
        let swarm = Arc::new(Swarm::new(DispatchStrategy::RoundRobin, None, event_bus.clone()));
        swarm
            .register(WorkerConfig::new("leader", "Leader", "you are the leader"), CircuitBreakerConfig::default(), 0)
            .unwrap();

        let conversation_loop =
            ConversationLoop::new(Arc::new(provider), plan_engine, swarm.clone(), event_bus, LoopConfig::default());
        (conversation_loop, swarm)
    }

    #[tokio::test]
    async fn a_plain_text_reply_ends_the_loop_in_one_turn() {
        let (conversation_loop, _swarm) = loop_with(MockProvider::new(vec!["hello there".into()]));
        let mut session = Session::new("s1", "leader", 0);
        let cancel = CancelHandle::new();

        let outcome = conversation_loop
            .run(&mut session, vec![Message::user("m1", "hi", 0)], RunOptions::default(), &cancel, || 0)
            .await
            .unwrap();

        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.message.text_content(), Some("hello there".to_string()));
    }

    #[tokio::test]
    async fn cancelling_before_run_surfaces_as_cancelled() {
        let (conversation_loop, _swarm) = loop_with(MockProvider::new(vec!["hi".into()]));
        let mut session = Session::new("s1", "leader", 0);
        let cancel = CancelHandle::new();
        cancel.cancel();

        let err = conversation_loop
            .run(&mut session, vec![Message::user("m1", "hi", 0)], RunOptions::default(), &cancel, || 0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn unknown_active_worker_is_a_handoff_target_missing_error() {
        let (conversation_loop, _swarm) = loop_with(MockProvider::new(vec!["hi".into()]));
        let mut session = Session::new("s1", "ghost", 0);
        let cancel = CancelHandle::new();

        let err = conversation_loop
            .run(&mut session, vec![Message::user("m1", "hi", 0)], RunOptions::default(), &cancel, || 0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::HandoffTargetMissing(id) if id == "ghost"));
    }

    struct HandoffOnce;

    #[async_trait]
    impl ToolHandler for HandoffOnce {
        async fn call(&self, _args: Value, _ctx: &ToolContext) -> std::result::Result<ToolResult, ToolError> {
            Ok(ToolResult::ok("ok").with_handoff("tester"))
        }
    }

    struct ScriptedToolCallProvider {
        turn: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl crate::provider::Provider for ScriptedToolCallProvider {
        fn model_id(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> std::result::Result<crate::provider::ProviderResponse, crate::provider::ProviderError> {
            let turn = self.turn.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let message = if turn == 0 {
                Message::assistant_tool_calls("call1", vec![crate::message::ToolCall::new("ask_tester_1", "ask_tester", Value::Null)], 0)
            } else {
                Message::assistant("handled by tester")
            };
            Ok(crate::provider::ProviderResponse::new(message))
        }
    }

    #[tokio::test]
    async fn a_tool_handoff_switches_the_active_worker_and_emits_a_handoff_event() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::new("ask_tester", "asks the tester worker", serde_json::json!({"type": "object"}))
                    .with_handler(Arc::new(HandoffOnce)),
            )
            .unwrap();

        let event_bus = Arc::new(EventBus::new(64));
        let plan_engine = Arc::new(ExecutionPlanEngine::new(
            Arc::new(tokio::sync::RwLock::new(registry)),
            Arc::new(PermissionArbiter::new()),
            event_bus.clone(),
        ));
        let swarm = Arc::new(Swarm::new(DispatchStrategy::RoundRobin, None, event_bus.clone()));
        swarm
            .register(WorkerConfig::new("leader", "Leader", "you triage and delegate"), CircuitBreakerConfig::default(), 0)
            .unwrap();
        swarm
            .register(WorkerConfig::new("tester", "Tester", "you answer test questions"), CircuitBreakerConfig::default(), 0)
            .unwrap();

        let mut events = event_bus.subscribe();
        let provider = Arc::new(ScriptedToolCallProvider { turn: std::sync::atomic::AtomicUsize::new(0) });
        let conversation_loop = ConversationLoop::new(provider, plan_engine, swarm.clone(), event_bus, LoopConfig::default());

        let mut session = Session::new("s1", "leader", 0);
        let cancel = CancelHandle::new();
        let outcome = conversation_loop
            .run(&mut session, vec![Message::user("m1", "hi", 0)], RunOptions::default(), &cancel, || 0)
            .await
            .unwrap();

        assert_eq!(outcome.turns, 2);
        assert_eq!(outcome.message.text_content(), Some("handled by tester".to_string()));
        assert_eq!(session.active_worker_id, "tester");

        let mut saw_handoff = false;
        while let Ok(event) = events.try_recv() {
            if let EventPayload::Handoff { from_worker, to_worker, .. } = event.payload {
                assert_eq!(from_worker, "leader");
                assert_eq!(to_worker, "tester");
                saw_handoff = true;
            }
        }
        assert!(saw_handoff, "expected a Handoff event");
    }

    #[test]
    fn from_env_overrides_max_turns() {
        use crate::provider::FromEnv;

        // SAFETY: test-only, no other thread in this process reads this key.
        unsafe { std::env::set_var("CRUCIBLE_LOOP_MAX_TURNS", "7") };
        let config = LoopConfig::from_env();
        unsafe { std::env::remove_var("CRUCIBLE_LOOP_MAX_TURNS") };

        assert_eq!(config.max_turns, 7);
        assert_eq!(config.turn_timeout, LoopConfig::default().turn_timeout);
    }
}
