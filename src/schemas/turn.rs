use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::lang::Value;

use super::ToolCallRecord;

/// Budget category of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnType {
    /// Regular work turn; tools available.
    Normal,
    /// Last work turn; tools stripped, only `(return ...)` / `(fail ...)`.
    MustReturn,
    /// Validation-retry turn after an invalid return.
    Retry,
}

impl fmt::Display for TurnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnType::Normal => "normal",
            TurnType::MustReturn => "must_return",
            TurnType::Retry => "retry",
        };
        write!(f, "{name}")
    }
}

/// One LLM round-trip and its executed program. Append-only: turns are never
/// mutated after being recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// 1-based.
    pub number: u32,
    #[serde(rename = "type")]
    pub turn_type: TurnType,
    /// Raw program source extracted from the LLM reply.
    pub program: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub prints: Vec<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Memory snapshot after this turn.
    pub memory: HashMap<String, Value>,
    pub success: bool,
}
