//! Message types for the session history.
//!
//! History is append-only: once a [`Message`] is pushed onto a
//! [`crate::session::Session`] it is never mutated, only read. [`ContentBlock`]
//! round-trips through serialization with bytes preserved, so a transcript
//! replayed from a snapshot is indistinguishable from the one that produced it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool response message.
    Tool,
}

impl MessageRole {
    /// The string representation used in logs and provider payloads.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A block of message content.
///
/// A message's content is an ordered sequence of these rather than a single
/// string, so a reply can interleave prose, code, and tool activity without
/// a second, parallel representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An inline image.
    Image {
        /// MIME type, e.g. `"image/png"`.
        mime: String,
        /// Raw bytes, base64-encoded on the wire.
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    /// A fenced code block.
    Code {
        /// Source text.
        text: String,
        /// Language tag, e.g. `"rust"`.
        language: String,
    },
    /// A tool invocation requested by the assistant.
    ToolUse {
        /// Correlates with a later `ToolResult` block and `Message::tool_call_id`.
        id: String,
        /// Name of the tool being invoked.
        name: String,
        /// Arguments, as parsed JSON.
        arguments: Value,
    },
    /// The result of a tool invocation.
    ToolResult {
        /// The `ToolUse::id` this result answers.
        use_id: String,
        /// The tool's textual result.
        content: String,
        /// Whether the tool call ended in an error.
        is_error: bool,
    },
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode(&s).map_err(serde::de::Error::custom)
    }

    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    fn encode(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
        for chunk in bytes.chunks(3) {
            let b = [
                chunk[0],
                *chunk.get(1).unwrap_or(&0),
                *chunk.get(2).unwrap_or(&0),
            ];
            let n = u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2]);
            out.push(ALPHABET[(n >> 18 & 0x3f) as usize] as char);
            out.push(ALPHABET[(n >> 12 & 0x3f) as usize] as char);
            out.push(if chunk.len() > 1 {
                ALPHABET[(n >> 6 & 0x3f) as usize] as char
            } else {
                '='
            });
            out.push(if chunk.len() > 2 {
                ALPHABET[(n & 0x3f) as usize] as char
            } else {
                '='
            });
        }
        out
    }

    fn decode(s: &str) -> Result<Vec<u8>, String> {
        let mut out = Vec::with_capacity(s.len() / 4 * 3);
        for chunk in s.as_bytes().chunks(4) {
            if chunk.len() != 4 {
                return Err("invalid base64 length".to_string());
            }
            let mut n: u32 = 0;
            let mut pad = 0;
            for &byte in chunk {
                n <<= 6;
                if byte == b'=' {
                    pad += 1;
                } else {
                    let index = ALPHABET
                        .iter()
                        .position(|&c| c == byte)
                        .ok_or_else(|| "invalid base64 character".to_string())?;
                    n |= index as u32;
                }
            }
            out.push((n >> 16 & 0xff) as u8);
            if pad < 2 {
                out.push((n >> 8 & 0xff) as u8);
            }
            if pad < 1 {
                out.push((n & 0xff) as u8);
            }
        }
        Ok(out)
    }
}

impl ContentBlock {
    /// A text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The block's text, if it carries one (`Text` or `Code`).
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::Code { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// A single tool call an assistant message requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call, referenced by the matching `tool` message.
    pub id: String,
    /// Name of the tool being invoked.
    pub name: String,
    /// Arguments, as parsed JSON.
    pub arguments: Value,
}

impl ToolCall {
    /// Construct a new tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A single entry in a session's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message within its session.
    pub id: String,
    /// Who sent it.
    pub role: MessageRole,
    /// Ordered content blocks.
    pub content: Vec<ContentBlock>,
    /// Tool calls requested by an assistant message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// For a `tool` message, the `ToolCall::id` it answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For a `tool` message, the name of the tool that produced it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Wall-clock time the message was appended, as Unix-epoch milliseconds.
    pub timestamp: u64,
}

impl Message {
    /// Construct a system message.
    #[must_use]
    pub fn system(id: impl Into<String>, text: impl Into<String>, timestamp: u64) -> Self {
        Self::with_text(id, MessageRole::System, text, timestamp)
    }

    /// Construct a user message.
    #[must_use]
    pub fn user(id: impl Into<String>, text: impl Into<String>, timestamp: u64) -> Self {
        Self::with_text(id, MessageRole::User, text, timestamp)
    }

    /// Construct an assistant message carrying plain text, with a generated id.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_text(uuid::Uuid::new_v4().to_string(), MessageRole::Assistant, text, 0)
    }

    /// Construct an assistant message whose only content is tool calls.
    #[must_use]
    pub fn assistant_tool_calls(id: impl Into<String>, tool_calls: Vec<ToolCall>, timestamp: u64) -> Self {
        Self {
            id: id.into(),
            role: MessageRole::Assistant,
            content: Vec::new(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            tool_name: None,
            timestamp,
        }
    }

    /// Construct a `tool` message answering `tool_call_id`.
    ///
    /// A `tool` message must reference a preceding assistant message's
    /// `tool_calls[i].id` — callers are responsible for that invariant.
    #[must_use]
    pub fn tool_result(
        id: impl Into<String>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            role: MessageRole::Tool,
            content: vec![ContentBlock::text(text)],
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            timestamp,
        }
    }

    fn with_text(id: impl Into<String>, role: MessageRole, text: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id: id.into(),
            role,
            content: vec![ContentBlock::text(text)],
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            timestamp,
        }
    }

    /// Concatenate every text-bearing content block, newline-separated.
    #[must_use]
    pub fn text_content(&self) -> Option<String> {
        if self.content.is_empty() {
            return None;
        }
        Some(
            self.content
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Whether this message carries one or more tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

/// Alias kept for provider-facing code that thinks in terms of chat
/// messages rather than the session's append-only history entries.
pub type ChatMessage = Message;
/// Alias for [`ToolCall`], matching the name providers' streaming deltas use.
pub type ChatMessageToolCall = ToolCall;

/// An incremental delta of an in-flight assistant message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageStreamDelta {
    /// Incremental text content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Incremental tool-call fragments, keyed by index within the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallStreamDelta>>,
}

/// An incremental fragment of a single tool call within a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallStreamDelta {
    /// Index of the tool call within the message being assembled.
    pub index: usize,
    /// Tool call id, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Tool name, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Incremental fragment of the JSON-encoded arguments string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments_fragment: Option<String>,
}

/// Aggregate a sequence of stream deltas into one assembled message.
#[must_use]
pub fn aggregate_stream_deltas(id: impl Into<String>, deltas: &[MessageStreamDelta], timestamp: u64) -> Message {
    let mut text = String::new();
    let mut calls: std::collections::BTreeMap<usize, (String, String, String)> =
        std::collections::BTreeMap::new();

    for delta in deltas {
        if let Some(c) = &delta.content {
            text.push_str(c);
        }
        if let Some(tc_deltas) = &delta.tool_calls {
            for tc in tc_deltas {
                let entry = calls.entry(tc.index).or_default();
                if let Some(id) = &tc.id {
                    entry.0.clone_from(id);
                }
                if let Some(name) = &tc.name {
                    entry.1.clone_from(name);
                }
                if let Some(fragment) = &tc.arguments_fragment {
                    entry.2.push_str(fragment);
                }
            }
        }
    }

    let tool_calls: Vec<ToolCall> = calls
        .into_values()
        .map(|(id, name, args_json)| {
            let arguments = serde_json::from_str(&args_json).unwrap_or(Value::Null);
            ToolCall::new(id, name, arguments)
        })
        .collect();

    Message {
        id: id.into(),
        role: MessageRole::Assistant,
        content: if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentBlock::text(text)]
        },
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        tool_call_id: None,
        tool_name: None,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod content_block {
        use super::*;

        #[test]
        fn image_bytes_round_trip_through_json() {
            let block = ContentBlock::Image {
                mime: "image/png".to_string(),
                bytes: vec![0, 1, 2, 253, 254, 255],
            };
            let json = serde_json::to_string(&block).unwrap();
            let back: ContentBlock = serde_json::from_str(&json).unwrap();
            let ContentBlock::Image { bytes, .. } = back else {
                panic!("expected image block");
            };
            assert_eq!(bytes, vec![0, 1, 2, 253, 254, 255]);
        }
    }

    mod message {
        use super::*;

        #[test]
        fn tool_result_references_call_id() {
            let msg = Message::tool_result("m2", "call-1", "echo", "42", 100);
            assert_eq!(msg.tool_call_id.as_deref(), Some("call-1"));
            assert_eq!(msg.role, MessageRole::Tool);
        }

        #[test]
        fn text_content_joins_blocks() {
            let msg = Message {
                id: "m1".into(),
                role: MessageRole::Assistant,
                content: vec![ContentBlock::text("a"), ContentBlock::text("b")],
                tool_calls: None,
                tool_call_id: None,
                tool_name: None,
                timestamp: 0,
            };
            assert_eq!(msg.text_content(), Some("a\nb".to_string()));
        }
    }

    mod streaming {
        use super::*;

        #[test]
        fn aggregates_text_and_tool_call_fragments() {
            let deltas = vec![
                MessageStreamDelta {
                    content: Some("Hel".into()),
                    tool_calls: None,
                },
                MessageStreamDelta {
                    content: Some("lo".into()),
                    tool_calls: Some(vec![ToolCallStreamDelta {
                        index: 0,
                        id: Some("call-1".into()),
                        name: Some("echo".into()),
                        arguments_fragment: Some("{\"x\":1}".into()),
                    }]),
                },
            ];
            let msg = aggregate_stream_deltas("m1", &deltas, 0);
            assert_eq!(msg.text_content(), Some("Hello".to_string()));
            let calls = msg.tool_calls.unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].name, "echo");
        }
    }
}
