use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A tool invocation requested by the LLM through a provider's native
/// tool-call API (text mode only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: JsonValue,
}

/// A completed tool invocation as recorded in a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub args: JsonValue,
    /// Summarized result (type-vocabulary capped), or the error message.
    pub result: String,
    pub duration_ms: u64,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
