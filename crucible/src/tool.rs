//! Tool Registry: the keyed set of tool definitions workers can invoke.
//!
//! A [`ToolDefinition`] pairs a JSON-schema-described call surface with a
//! [`ToolHandler`] implementation. The registry's `invoke` is the only
//! execution entry point — it validates input against the schema, applies
//! the tool's declared timeout, and translates handler errors into an
//! [`ToolResult`] with `is_error` set rather than propagating them, so a
//! failing tool call is just more conversation for the Leader to react to.
//! Cancellation is the one thing `invoke` never swallows: it propagates out
//! as [`crate::error::EngineError::Cancelled`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// A capability-scoped permission a tool may require before it can run.
///
/// Permissions are opaque strings from the registry's point of view (e.g.
/// `"fs:write"`, `"network:egress"`) — the Permission Arbiter is what gives
/// them meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission(pub String);

impl Permission {
    /// Create a new permission from anything string-like.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the permission's name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Permission {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Risk classification used by the Permission Arbiter's auto-approve rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only, side-effect free.
    #[default]
    Safe,
    /// Small, reversible side effects.
    Low,
    /// Meaningful side effects on session-local state.
    Medium,
    /// Irreversible or externally visible side effects.
    High,
}

/// A side effect a tool invocation reports having caused, surfaced to the
/// event sink and audit log rather than inferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideEffect {
    /// Short machine-readable kind, e.g. `"file_write"`, `"http_request"`.
    pub kind: String,
    /// Human-readable description for logs and transcripts.
    pub description: String,
}

impl SideEffect {
    /// Construct a side effect report.
    #[must_use]
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self { kind: kind.into(), description: description.into() }
    }
}

/// The value a tool handler returns.
///
/// `handoff_target` is how a tool hands control to another worker: rather
/// than a second control channel alongside tool calls, a handoff is just a
/// field on the same `ToolResult` every tool call already produces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    /// The tool's textual result, fed back into the conversation.
    pub value: String,
    /// Partial update to apply to the session's context variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_context_variables: Option<HashMap<String, Value>>,
    /// If set, the Leader should hand off to this worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_target: Option<String>,
    /// Side effects the handler reports having caused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<Vec<SideEffect>>,
    /// Error detail, set together with `is_error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether this outcome represents a translated handler error.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// A successful outcome carrying `value`.
    #[must_use]
    pub fn ok(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    /// An outcome representing a translated handler error.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            value: message.clone(),
            error: Some(message),
            is_error: true,
            ..Self::default()
        }
    }

    /// Attach a handoff target to this outcome, builder-style.
    #[must_use]
    pub fn with_handoff(mut self, worker_id: impl Into<String>) -> Self {
        self.handoff_target = Some(worker_id.into());
        self
    }

    /// Attach context-variable updates to this outcome, builder-style.
    #[must_use]
    pub fn with_context_update(mut self, updates: HashMap<String, Value>) -> Self {
        self.updated_context_variables = Some(updates);
        self
    }
}

/// Errors a [`ToolHandler`] or the registry can produce.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The tool is not registered.
    #[error("unknown tool '{0}'")]
    NotFound(String),
    /// Input failed to deserialize into the handler's expected shape.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// Input failed schema validation; names the offending fields.
    #[error("schema violation: {0:?}")]
    SchemaViolation(Vec<String>),
    /// The handler itself returned an error.
    #[error("execution error: {0}")]
    ExecutionError(String),
    /// The tool's declared timeout elapsed before the handler returned.
    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),
    /// The call's abort signal fired before the handler returned.
    #[error("tool call was cancelled")]
    Cancelled,
}

/// Handle through which a running tool observes cancellation and reaches
/// session-scoped state.
///
/// Forwarded to every `ToolHandler::call` so a handler can poll
/// `ctx.is_cancelled()` during long-running work instead of only being
/// killed at its `await` points.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Session this call belongs to.
    pub session_id: String,
    /// Working directory tool handlers should resolve relative paths against.
    pub working_directory: std::path::PathBuf,
    /// Read-only snapshot of the session's context variables at call time.
    pub context_variables: HashMap<String, Value>,
    /// Unique identifier for this specific call, for correlation in logs.
    pub call_id: String,
    notify: Arc<tokio::sync::Notify>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl ToolContext {
    /// Create a new context for a call within `session_id`.
    #[must_use]
    pub fn new(session_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            working_directory: std::env::current_dir().unwrap_or_default(),
            context_variables: HashMap::new(),
            call_id: call_id.into(),
            notify: Arc::new(tokio::sync::Notify::new()),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Attach a snapshot of context variables, builder-style.
    #[must_use]
    pub fn with_context_variables(mut self, vars: HashMap<String, Value>) -> Self {
        self.context_variables = vars;
        self
    }

    /// Whether this call has been aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Abort this call. Idempotent.
    pub fn abort(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolve once `abort` is called, for use in a `select!` alongside the
    /// handler's own future.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// A tool's executable behavior.
///
/// Implemented by hand for ad hoc tools, or generated by
/// `crucible_derive::tool` from a plain async function.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool against already-schema-validated `args`.
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError>;
}

/// A tool definition: its call surface plus the handler that implements it.
#[derive(Clone)]
pub struct ToolDefinition {
    /// Stable identifier, distinct from `name` when a tool is renamed for
    /// display without breaking references held by existing plans.
    pub id: String,
    /// Name the model sees and calls by.
    pub name: String,
    /// Description surfaced to the model.
    pub description: String,
    /// JSON Schema describing valid input.
    pub input_schema: Value,
    /// JSON Schema describing the shape of `ToolResult::value`, if fixed.
    pub output_schema: Option<Value>,
    /// Risk classification consulted by the Permission Arbiter.
    pub risk_level: RiskLevel,
    /// Permissions a caller must hold to invoke this tool.
    pub permissions: HashSet<Permission>,
    /// Timeout applied to every invocation of this tool.
    pub timeout: Duration,
    handler: Option<Arc<dyn ToolHandler>>,
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("description", &self.description)
            .field("risk_level", &self.risk_level)
            .field("permissions", &self.permissions)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

impl ToolDefinition {
    /// Start building a new tool definition. `id` defaults to `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            description: description.into(),
            input_schema,
            output_schema: None,
            risk_level: RiskLevel::default(),
            permissions: HashSet::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
            handler: None,
        }
    }

    /// Attach the handler that implements this tool.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Override the stable id, builder-style.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the output schema, builder-style.
    #[must_use]
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Set the risk level, builder-style.
    #[must_use]
    pub const fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    /// Require a permission, builder-style.
    #[must_use]
    pub fn with_permission(mut self, permission: impl Into<Permission>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    /// Override the invocation timeout, builder-style.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate `input` against `input_schema` by a structural walk: every
    /// required top-level property must be present, and every present
    /// property whose schema names a primitive JSON type (`string`,
    /// `number`, `integer`, `boolean`, `array`, `object`) must match that
    /// type tag. Names any offending fields.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::SchemaViolation`] listing every missing required
    /// field and every present field whose value does not match its
    /// declared type.
    pub fn validate(&self, input: &Value) -> std::result::Result<(), ToolError> {
        let required = self.input_schema.get("required").and_then(Value::as_array);
        let properties = self.input_schema.get("properties").and_then(Value::as_object);

        let mut offending: Vec<String> = required
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .filter(|field| input.get(field).is_none())
            .map(str::to_string)
            .collect();

        if let Some(properties) = properties {
            for (field, schema) in properties {
                let Some(value) = input.get(field) else { continue };
                let Some(expected) = schema.get("type").and_then(Value::as_str) else { continue };
                if !matches_json_type(value, expected) {
                    offending.push(field.clone());
                }
            }
        }

        if offending.is_empty() {
            Ok(())
        } else {
            offending.sort();
            offending.dedup();
            Err(ToolError::SchemaViolation(offending))
        }
    }
}

/// The keyed set of tool definitions available for invocation.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDefinition>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("names", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool definition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateTool`] if a tool with the same name
    /// is already registered.
    pub fn register(&mut self, def: ToolDefinition) -> Result<()> {
        if self.tools.contains_key(&def.name) {
            return Err(EngineError::DuplicateTool(def.name));
        }
        self.tools.insert(def.name.clone(), def);
        Ok(())
    }

    /// Remove a tool definition, returning it if it existed.
    pub fn unregister(&mut self, name: &str) -> Option<ToolDefinition> {
        self.tools.remove(name)
    }

    /// Look up a tool definition by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// All registered tool definitions, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry holds no tools.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate `input` against the named tool's schema.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SchemaViolation`] if validation fails, or a
    /// not-found error wrapped as a [`ToolError`] if `name` is unregistered.
    pub fn validate(&self, name: &str, input: &Value) -> Result<()> {
        let def = self
            .tools
            .get(name)
            .ok_or_else(|| EngineError::ToolError(ToolError::NotFound(name.to_string())))?;

        def.validate(input)
            .map_err(|err| match err {
                ToolError::SchemaViolation(fields) => EngineError::SchemaViolation {
                    tool: name.to_string(),
                    fields,
                },
                other => EngineError::ToolError(other),
            })
    }

    /// The only execution entry point: validates `input`, enforces the
    /// tool's declared timeout, and forwards `ctx` to the handler.
    ///
    /// A handler error is translated into a returned [`ToolResult`] with
    /// `is_error` set rather than bubbled up as an `Err`. Cancellation is the
    /// one exception — it propagates out as [`EngineError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is unregistered, if `input` fails schema
    /// validation, or if the call is cancelled via `ctx`.
    pub async fn invoke(&self, name: &str, input: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let def = self
            .tools
            .get(name)
            .ok_or_else(|| EngineError::ToolError(ToolError::NotFound(name.to_string())))?;

        self.validate(name, &input)?;

        let Some(handler) = &def.handler else {
            return Err(EngineError::Internal(format!(
                "tool '{name}' has no handler attached"
            )));
        };

        tokio::select! {
            () = ctx.cancelled() => Err(EngineError::Cancelled),
            result = tokio::time::timeout(def.timeout, handler.call(input, ctx)) => {
                match result {
                    Err(_elapsed) => Err(EngineError::ToolError(ToolError::Timeout(def.timeout))),
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(handler_err)) => Ok(ToolResult::error(handler_err.to_string())),
                }
            }
        }
    }
}

/// Whether `value` matches the primitive JSON Schema type tag `expected`.
/// Unrecognized type tags are treated as unconstrained (always match).
fn matches_json_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}
