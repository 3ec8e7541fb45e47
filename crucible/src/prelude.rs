//! Prelude module for convenient imports.
//!
//! Re-exports the most commonly used types and traits so you can get
//! started with a single `use` statement.
//!
//! ```rust
//! use crucible::prelude::*;
//!
//! let facade_builder = EngineFacadeBuilder::new(std::sync::Arc::new(MockProvider::new(vec!["hi".into()])))
//!     .worker(WorkerConfig::new("leader", "Leader", "You are the leader."), CircuitBreakerConfig::default());
//! ```

pub use crate::circuit::{BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
pub use crate::context::ContextVariables;
pub use crate::error::{EngineError, Result};
pub use crate::events::{Event, EventBus, EventPayload, EventSink};
pub use crate::facade::{EngineFacade, EngineFacadeBuilder, FacadeConfig, HealthProbeConfig};
pub use crate::loop_::{CancelHandle, ConversationLoop, LoopConfig, RunOptions, RunOutcome, StreamEvent};
pub use crate::message::{ChatMessage, ChatMessageToolCall, ContentBlock, Message, MessageRole, ToolCall};
pub use crate::observability::{EngineSnapshot, MetricsSink, PlanObservation, RunMetrics, WorkerObservation};
pub use crate::permission::{Decision, PermissionArbiter};
pub use crate::plan::{ExecutionPlan, ExecutionPlanEngine, PlanConfig, PlanStatus, SchedulingMode};
pub use crate::provider::{FromEnv, MockProvider, Provider, ProviderError, ProviderRequest, ProviderResponse};
pub use crate::session::{Session, SessionSnapshot};
pub use crate::swarm::{DispatchStrategy, Swarm, WorkerConfig, WorkerHealth, WorkerMetrics};
pub use crate::tool::{Permission, RiskLevel, ToolContext, ToolDefinition, ToolError, ToolHandler, ToolRegistry, ToolResult};
pub use crate::usage::{Usage, UsageTracker};

#[cfg(feature = "derive")]
pub use crucible_derive::tool;
