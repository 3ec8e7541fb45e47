//! `ExecutionStep`: one tool invocation within a plan, plus its status
//! machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool::ToolResult;

/// Priority band a step or worker is scheduled at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Scheduled last.
    Background,
    /// Below-normal priority.
    Low,
    /// Default priority.
    Normal,
    /// Above-normal priority.
    High,
    /// Scheduled first.
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// A step's place in its lifecycle.
///
/// Invariant: a step is `Ready` iff every step named in `dependencies` is
/// `Completed`; a step is `Running` iff `started_at` is set and
/// `completed_at` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet ready: at least one dependency has not completed.
    Pending,
    /// Every dependency is `Completed`; eligible for dispatch.
    Ready,
    /// Dispatched to the Permission Arbiter; awaiting a user decision.
    WaitingPermission,
    /// The tool handler is executing.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed and will not be retried.
    Failed,
    /// Skipped, e.g. because permission was denied or timed out.
    Skipped,
}

/// One tool invocation within an [`crate::plan::engine::ExecutionPlan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Unique id within the owning plan.
    pub id: String,
    /// Owning plan's id.
    pub plan_id: String,
    /// Tool to invoke.
    pub tool_id: String,
    /// Arguments to pass to the tool.
    pub inputs: Value,
    /// Current lifecycle status.
    pub status: StepStatus,
    /// Scheduling priority, consulted by the `Priority` mode.
    pub priority: Priority,
    /// Ids of steps that must be `Completed` before this one is `Ready`.
    pub dependencies: Vec<String>,
    /// Ids of steps that depend on this one.
    pub dependents: Vec<String>,
    /// Maximum retry attempts on recoverable failure.
    pub max_retries: u32,
    /// Retries already attempted.
    pub retry_count: u32,
    /// Timeout for a single invocation of this step.
    pub timeout: Duration,
    /// The tool's result, once the step has run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    /// When the step transitioned to `Running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// When the step transitioned out of `Running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl ExecutionStep {
    /// Construct a new, `Pending` step.
    #[must_use]
    pub fn new(id: impl Into<String>, plan_id: impl Into<String>, tool_id: impl Into<String>, inputs: Value) -> Self {
        Self {
            id: id.into(),
            plan_id: plan_id.into(),
            tool_id: tool_id.into(),
            inputs,
            status: StepStatus::Pending,
            priority: Priority::default(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            max_retries: 0,
            retry_count: 0,
            timeout: Duration::from_secs(30),
            result: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Set dependencies, builder-style.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Set priority, builder-style.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget, builder-style.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the per-invocation timeout, builder-style.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether retries remain under `max_retries`.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
