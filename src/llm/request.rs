use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::schemas::{Message, ToolCallRequest};

/// Output constraint passed to providers that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Text,
}

/// One request to an LLM. The runtime never talks HTTP itself; this is the
/// whole contract an implementation has to satisfy.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<Message>,
    /// 1-based turn number, for logging and replay.
    pub turn: u32,
    /// Names of tools callable this turn; empty on must-return and retry
    /// turns.
    pub tool_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputFormat>,
    /// JSON Schema of the expected return value (JSON mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<JsonValue>,
    /// JSON function schemas for native tool calling (text mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<JsonValue>>,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, messages: Vec<Message>, turn: u32) -> Self {
        Self {
            system: system.into(),
            messages,
            turn,
            tool_names: Vec::new(),
            output: None,
            schema: None,
            tools: None,
        }
    }
}

/// Completed LLM reply. Token counts are optional on the wire; absent fields
/// count as zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub tokens: TokenUsage,
    /// Native tool calls, when the provider supports them (text mode).
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_creation: u64,
    #[serde(default)]
    pub cache_read: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            cache_creation: 0,
            cache_read: 0,
        }
    }
}
