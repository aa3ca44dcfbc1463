//! Language-model client trait: the seam to whatever executes the request.
//!
//! The engine never speaks a wire format. It hands a [`ModelRequest`] to a
//! [`LanguageModelClient`] and gets back either a [`ModelResponse`] or a
//! classified [`RequestError`]. Transient errors drive the progressive
//! optimizer's retry path; permanent ones propagate immediately.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RequestError, TokenCountError};
use crate::message::{Message, MessageToolCall};

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// The final merged payload: system instructions, tool schemas, the
/// assembled history, and the current user message last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,

    /// System instructions
    pub system: String,

    /// Assembled history followed by the current user message
    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A complete response from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub message: Message,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Which model actually responded
    pub model: String,
}

impl ModelResponse {
    /// A response with neither text nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.message.content.trim().is_empty() && self.message.tool_calls.is_empty()
    }

    pub fn tool_calls(&self) -> &[MessageToolCall] {
        &self.message.tool_calls
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The language-model client.
#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    /// A human-readable name (e.g. "anthropic", "mock").
    fn name(&self) -> &str;

    /// Execute the request.
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, RequestError>;
}

/// A precise, model-specific token counter (usually backed by the
/// provider's counting endpoint or a cached local equivalent).
///
/// Synchronous on purpose: counting sits on the assembly hot path and the
/// token accounting service must never await.
pub trait PreciseTokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> Result<usize, TokenCountError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_response_detection() {
        let resp = ModelResponse {
            message: Message::assistant("   "),
            usage: None,
            model: "mock".into(),
        };
        assert!(resp.is_empty());

        let with_call = ModelResponse {
            message: Message::assistant("").with_tool_calls(vec![MessageToolCall::new(
                "c1",
                "read_file",
                serde_json::json!({"path": "a.rs"}),
            )]),
            usage: None,
            model: "mock".into(),
        };
        assert!(!with_call.is_empty());
        assert_eq!(with_call.tool_calls().len(), 1);
    }

    #[test]
    fn tool_definition_serialization() {
        let tool = ToolDefinition {
            name: "shell".into(),
            description: "Execute a shell command".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            }),
        };
        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains("shell"));
        assert!(json.contains("command"));
    }
}
