//! Integration tests for the crucible crate: end-to-end runs through the
//! [`EngineFacade`], mirroring the demo wiring in `crucible-cli`'s binary
//! (a scripted provider, a registered tool, and a leader/specialist worker
//! pair) but driven from assertions instead of printed output.

#![allow(clippy::unwrap_used, clippy::panic, clippy::clone_on_ref_ptr)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use crucible::circuit::CircuitBreakerConfig;
use crucible::facade::{EngineFacade, EngineFacadeBuilder};
use crucible::message::{ChatMessage, Message, ToolCall};
use crucible::provider::{FinishReason, Provider, ProviderError, ProviderRequest, ProviderResponse};
use crucible::swarm::WorkerConfig;
use crucible::tool::{ToolContext, ToolDefinition, ToolError, ToolHandler, ToolResult};

/// A two-turn scripted provider: first asks for a weather lookup, then,
/// once the tool result is in history, hands off to a specialist worker and
/// answers in plain text.
struct DemoProvider {
    turn: AtomicUsize,
}

#[async_trait]
impl Provider for DemoProvider {
    fn model_id(&self) -> &str {
        "demo-provider"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let turn = self.turn.fetch_add(1, Ordering::SeqCst);
        Ok(match turn {
            0 => ProviderResponse::new(ChatMessage::assistant_tool_calls(
                "call-1",
                vec![ToolCall::new("lookup-1", "lookup_weather", json!({"city": "Paris"}))],
                0,
            ))
            .with_finish_reason(FinishReason::ToolCalls),
            _ => ProviderResponse::new(ChatMessage::assistant("It's sunny in Paris today.")),
        })
    }
}

struct LookupWeather;

#[async_trait]
impl ToolHandler for LookupWeather {
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        assert_eq!(ctx.context_variables.get("locale").and_then(Value::as_str), Some("en-US"));
        let city = args.get("city").and_then(Value::as_str).unwrap_or("unknown");
        Ok(ToolResult::ok(format!("sunny, 22C in {city}")).with_handoff("specialist"))
    }
}

fn build_facade() -> EngineFacade {
    EngineFacadeBuilder::new(Arc::new(DemoProvider { turn: AtomicUsize::new(0) }))
        .tool(
            ToolDefinition::new("lookup_weather", "Look up the current weather for a city", json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"],
            }))
            .with_handler(Arc::new(LookupWeather)),
        )
        .worker(
            WorkerConfig::new("leader", "Leader", "You triage requests and delegate to specialists."),
            CircuitBreakerConfig::default(),
        )
        .worker(
            WorkerConfig::new("specialist", "Specialist", "You answer weather questions."),
            CircuitBreakerConfig::default(),
        )
        .try_build(0)
        .expect("facade construction")
}

#[tokio::test]
async fn a_facade_driven_run_invokes_a_tool_hands_off_and_returns_a_final_answer() {
    let facade = build_facade();
    facade.create_session("demo", "leader", 0).await.expect("session creation");

    let mut context_overrides = HashMap::new();
    context_overrides.insert("locale".to_string(), json!("en-US"));

    let outcome = facade
        .run("demo", vec![Message::user("m1", "What's the weather in Paris?", 0)], context_overrides, || 0)
        .await
        .expect("run");

    assert_eq!(outcome.message.text_content(), Some("It's sunny in Paris today."));
    assert_eq!(outcome.turns, 2);

    let snapshot = facade.snapshot_session("demo").await.expect("snapshot");
    assert_eq!(snapshot.active_worker_id, "specialist");

    facade.shutdown().await;
}

#[tokio::test]
async fn running_against_an_unknown_session_is_an_error() {
    let facade = build_facade();

    let result = facade.run("nope", vec![Message::user("m1", "hi", 0)], HashMap::new(), || 0).await;

    assert!(result.is_err());
    facade.shutdown().await;
}
