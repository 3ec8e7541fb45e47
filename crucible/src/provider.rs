//! The external Provider interface: the one seam where the engine calls out
//! to an LLM.
//!
//! [`Provider`] is intentionally thin — `complete` and `complete_stream` —
//! so that swapping models or backends never touches the Conversation Loop,
//! Worker Pool, or Plan Engine above it. [`MockProvider`] cycles canned
//! responses for tests and the demo binary, the way a hand-rolled model
//! double would for any other dependency boundary.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::message::{ChatMessage, ChatMessageToolCall};
use crate::tool::ToolDefinition;
use crate::usage::Usage;

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model produced a natural stop.
    Stop,
    /// The model emitted one or more tool calls.
    ToolCalls,
    /// Generation was cut off by `max_tokens`.
    Length,
    /// The provider reported an error mid-stream.
    Error,
}

/// How the model should decide whether to call a tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// Let the model decide.
    #[default]
    Auto,
    /// Never call a tool.
    None,
    /// Always call some tool.
    Required,
    /// Force a specific named tool.
    Named(String),
}

/// A request to a provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    /// Conversation history to complete.
    pub messages: Vec<ChatMessage>,
    /// Tools the model may call.
    pub tools: Vec<ToolDefinition>,
    /// Tool-choice policy for this request.
    pub tool_choice: ToolChoice,
    /// Model identifier to route to, if the provider serves more than one.
    pub model: Option<String>,
}

impl ProviderRequest {
    /// Start a request over `messages` with no tools offered.
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Offer `tools` to the model, builder-style.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Set the tool-choice policy, builder-style.
    #[must_use]
    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = tool_choice;
        self
    }
}

/// A complete response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message.
    pub message: ChatMessage,
    /// Token usage for this request, if the provider reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

impl ProviderResponse {
    /// A response carrying `message` with `finish_reason` set to `Stop`.
    #[must_use]
    pub const fn new(message: ChatMessage) -> Self {
        Self {
            message,
            usage: None,
            finish_reason: FinishReason::Stop,
        }
    }

    /// Set the finish reason, builder-style.
    #[must_use]
    pub const fn with_finish_reason(mut self, finish_reason: FinishReason) -> Self {
        self.finish_reason = finish_reason;
        self
    }

    /// Set token usage, builder-style.
    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Whether the model asked to call a tool.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.message.has_tool_calls()
    }
}

/// An incremental delta within a streaming completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderChunk {
    /// Incremental text content, if any arrived in this chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Incremental tool-call fragments, if any arrived in this chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatMessageToolCall>>,
    /// Set on the final chunk of the stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Errors a provider can produce.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider rejected the request (bad input, auth, rate limit).
    #[error("provider request failed: {0}")]
    RequestFailed(String),
    /// The provider's response could not be parsed into a `ProviderResponse`.
    #[error("provider response was malformed: {0}")]
    MalformedResponse(String),
    /// The request exceeded its configured timeout.
    #[error("provider request timed out")]
    Timeout,
}

/// A lazily-produced sequence of completion chunks.
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderChunk, ProviderError>> + Send>>;

/// Trait for configuration that can be populated from `CRUCIBLE_*`
/// environment variables, falling back to its [`Default`] for anything
/// unset.
///
/// Unlike a provider credential, every config this crate loads from the
/// environment has a workable default, so `from_env` never panics — it
/// only overrides fields whose variable is actually present and
/// well-formed.
pub trait FromEnv: Sized + Default {
    /// Build a value by layering `CRUCIBLE_*` environment variables over
    /// [`Default::default`].
    fn from_env() -> Self;
}

/// Parse an environment variable into `T`, ignoring it (falling back to
/// `fallback`) if it is unset or fails to parse.
pub(crate) fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key).ok().and_then(|value| value.parse().ok()).unwrap_or(fallback)
}

/// The engine's one seam onto an LLM backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Identifier for the backing model, for logs and metrics labels.
    fn model_id(&self) -> &str;

    /// Complete `request` and return the full response.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the backend rejects the request or its
    /// response cannot be parsed.
    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Complete `request`, streaming chunks as they arrive.
    ///
    /// Default implementation falls back to [`Provider::complete`] and
    /// yields the whole response as a single chunk.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] under the same conditions as `complete`.
    async fn complete_stream(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderStream, ProviderError> {
        let response = self.complete(request).await?;
        let chunk = ProviderChunk {
            content: response.message.text_content(),
            tool_calls: response.message.tool_calls.clone(),
            finish_reason: Some(response.finish_reason),
        };
        Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }

    /// Whether this provider supports `complete_stream` natively.
    fn supports_streaming(&self) -> bool {
        false
    }
}

/// A provider that cycles through a fixed list of canned text responses.
///
/// Mirrors a hand-rolled test double for any other external dependency: no
/// network access, deterministic, cheap to construct per test.
#[derive(Debug)]
pub struct MockProvider {
    model_id: String,
    responses: Vec<String>,
    next: std::sync::atomic::AtomicUsize,
}

impl MockProvider {
    /// Create a mock provider cycling through `responses` in order.
    #[must_use]
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            model_id: "mock-provider".to_string(),
            responses,
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Override the reported model id, builder-style.
    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        if self.responses.is_empty() {
            return Err(ProviderError::RequestFailed(
                "mock provider has no configured responses".to_string(),
            ));
        }
        let index = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let text = self.responses[index % self.responses.len()].clone();
        Ok(ProviderResponse::new(ChatMessage::assistant(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod mock_provider {
        use super::*;

        #[tokio::test]
        async fn cycles_through_responses() {
            let provider = MockProvider::new(vec!["first".into(), "second".into()]);
            let r1 = provider.complete(ProviderRequest::new(vec![])).await.unwrap();
            assert_eq!(r1.message.text_content(), Some("first".to_string()));
            let r2 = provider.complete(ProviderRequest::new(vec![])).await.unwrap();
            assert_eq!(r2.message.text_content(), Some("second".to_string()));
            let r3 = provider.complete(ProviderRequest::new(vec![])).await.unwrap();
            assert_eq!(r3.message.text_content(), Some("first".to_string()));
        }

        #[tokio::test]
        async fn empty_responses_is_an_error() {
            let provider = MockProvider::new(vec![]);
            assert!(provider.complete(ProviderRequest::new(vec![])).await.is_err());
        }

        #[tokio::test]
        async fn default_complete_stream_yields_one_chunk() {
            use futures::StreamExt;

            let provider = MockProvider::new(vec!["hello".into()]);
            let mut stream = provider
                .complete_stream(ProviderRequest::new(vec![]))
                .await
                .unwrap();
            let chunk = stream.next().await.unwrap().unwrap();
            assert_eq!(chunk.content, Some("hello".to_string()));
            assert_eq!(chunk.finish_reason, Some(FinishReason::Stop));
            assert!(stream.next().await.is_none());
        }
    }
}
