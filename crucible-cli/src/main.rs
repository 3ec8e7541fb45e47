//! Demo binary: wires a toy provider, a weather tool, and two workers
//! through the Engine Facade, then runs one session end to end — a tool
//! call, a handoff, and a final answer.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use crucible::circuit::CircuitBreakerConfig;
use crucible::facade::EngineFacadeBuilder;
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
    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let city = args.get("city").and_then(Value::as_str).unwrap_or("unknown");
        Ok(ToolResult::ok(format!("sunny, 22C in {city}")).with_handoff("specialist"))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let facade = EngineFacadeBuilder::new(Arc::new(DemoProvider { turn: AtomicUsize::new(0) }))
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
        .expect("facade construction");

    facade.create_session("demo", "leader", 0).await.expect("session creation");

    let outcome = facade
        .run("demo", vec![Message::user("m1", "What's the weather in Paris?", 0)], Default::default(), || 0)
        .await
        .expect("run");

    println!("turns taken: {}", outcome.turns);
    println!("final answer: {}", outcome.message.text_content().unwrap_or_default());

    let snapshot = facade.snapshot_session("demo").await.expect("snapshot");
    println!("active worker: {}", snapshot.active_worker_id);

    facade.shutdown().await;
}
