use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::lang::Value;

use super::{Message, Turn};

/// Immutable result of one agent run. Exactly one of `return_value` / `fail`
/// is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "return")]
    pub return_value: Option<Value>,
    pub fail: Option<Fail>,
    /// Final per-agent scratchpad.
    pub memory: HashMap<String, Value>,
    /// Per-turn records, when tracing was enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turns: Option<Vec<Turn>>,
    /// Full LLM exchange, when `collect_messages` was enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    pub usage: Usage,
}

impl Step {
    pub fn success(&self) -> bool {
        self.fail.is_none()
    }
}

/// Structured failure carried by a [`Step`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fail {
    /// Machine-readable reason from the failure taxonomy,
    /// e.g. `budget_exhausted`, `tool_error`.
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Fail {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Aggregate resource accounting for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub duration_ms: u64,
    pub turns: u32,
    /// Includes transport retries; turns do not.
    pub llm_requests: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}
