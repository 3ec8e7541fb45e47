//! Error types for the orchestration engine.
//!
//! The top-level [`EngineError`] is a hand-rolled taxonomy (manual
//! `Display`, no `thiserror`) mirroring the five error groups of the
//! component design: validation, permission, execution, orchestration, and
//! provider errors. Leaf errors for structurally regular subsets —
//! [`crate::tool::ToolError`] and [`crate::provider::ProviderError`] — are
//! `thiserror`-derived instead; both styles are kept deliberately rather
//! than flattened to one convention.

use std::fmt;

use crate::provider::ProviderError;
use crate::tool::ToolError;

/// A type alias for `Result<T, EngineError>`.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The top-level error taxonomy for the orchestration engine.
#[derive(Debug)]
pub enum EngineError {
    /// A tool definition's input failed schema validation.
    SchemaViolation {
        /// Name of the tool whose input failed validation.
        tool: String,
        /// The offending field names.
        fields: Vec<String>,
    },
    /// A tool with the same name is already registered.
    DuplicateTool(String),
    /// A plan failed validation at creation time (cycle, dangling
    /// dependency, or duplicate step ID).
    InvalidPlan(String),
    /// An operation was attempted against a plan/session in the wrong
    /// state (e.g. re-executing a plan that already ran).
    InvalidState(String),

    /// A permission check resolved to `Denied`.
    PermissionDenied {
        /// Tool the permission check was for.
        tool: String,
        /// Reason supplied by the policy.
        reason: String,
    },
    /// A `Prompt` decision was not resolved before the permission timeout.
    PermissionTimeout(String),

    /// A tool handler returned an error.
    ToolError(ToolError),
    /// A step exceeded its configured timeout.
    StepTimeout {
        /// Step that timed out.
        step: String,
    },
    /// The worker's circuit breaker is open.
    CircuitOpen {
        /// Worker whose breaker is open.
        worker: String,
    },

    /// A plan's overall timeout elapsed before completion.
    PlanTimeout(String),
    /// A plan was cancelled before completion.
    PlanCancelled(String),
    /// No healthy worker was available to service a dispatch.
    NoHealthyWorker,
    /// A handoff directive named a worker that is not registered/healthy.
    HandoffTargetMissing(String),

    /// The external provider returned an error.
    Provider(ProviderError),

    /// Cancellation propagated out of an in-flight operation.
    Cancelled,
    /// A catch-all for conditions the taxonomy above does not name.
    Internal(String),
}

impl EngineError {
    /// Whether retrying the operation that produced this error is ever
    /// sensible. Validation and permission errors are never retried.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ToolError(_) | Self::StepTimeout { .. } | Self::Provider(_)
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchemaViolation { tool, fields } => {
                write!(f, "schema violation for tool '{tool}': {}", fields.join(", "))
            }
            Self::DuplicateTool(name) => write!(f, "tool '{name}' is already registered"),
            Self::InvalidPlan(msg) => write!(f, "invalid plan: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::PermissionDenied { tool, reason } => {
                write!(f, "permission denied for tool '{tool}': {reason}")
            }
            Self::PermissionTimeout(tool) => write!(f, "permission prompt timed out for '{tool}'"),
            Self::ToolError(e) => write!(f, "tool error: {e}"),
            Self::StepTimeout { step } => write!(f, "step '{step}' timed out"),
            Self::CircuitOpen { worker } => write!(f, "circuit breaker open for worker '{worker}'"),
            Self::PlanTimeout(plan) => write!(f, "plan '{plan}' timed out"),
            Self::PlanCancelled(plan) => write!(f, "plan '{plan}' was cancelled"),
            Self::NoHealthyWorker => write!(f, "no healthy worker available"),
            Self::HandoffTargetMissing(worker) => {
                write!(f, "handoff target '{worker}' is not registered or unhealthy")
            }
            Self::Provider(e) => write!(f, "provider error: {e}"),
            Self::Cancelled => write!(f, "operation was cancelled"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ToolError> for EngineError {
    fn from(err: ToolError) -> Self {
        Self::ToolError(err)
    }
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(EngineError::ToolError(ToolError::ExecutionError("x".into())).is_recoverable());
        assert!(!EngineError::DuplicateTool("x".into()).is_recoverable());
        assert!(!EngineError::PermissionDenied {
            tool: "x".into(),
            reason: "no".into()
        }
        .is_recoverable());
    }

    #[test]
    fn display_messages_are_descriptive() {
        let e = EngineError::InvalidPlan("cycle detected".into());
        assert!(e.to_string().contains("cycle detected"));
    }
}
