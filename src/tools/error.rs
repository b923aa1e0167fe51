use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    /// Handler failure; also produced when a handler returns an
    /// `{"error": ...}` map.
    #[error("{0}")]
    Execution(String),

    #[error("tool timed out after {0:?}")]
    Timeout(Duration),

    #[error("no tool named '{0}' is registered")]
    NotFound(String),

    #[error("tool '{0}' is catalog-only and cannot be invoked; it is listed for planning")]
    CatalogOnly(String),

    #[error("tool call limit of {0} exceeded")]
    CallLimit(usize),

    #[error("recursion depth limit of {0} exceeded")]
    MaxDepth(u32),

    /// A nested agent run ended in failure.
    #[error("nested agent '{name}' failed: {message}")]
    NestedAgent { name: String, message: String },
}

impl ToolError {
    pub fn reason(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "tool_not_found",
            ToolError::CallLimit(_) => "tool_call_limit_exceeded",
            ToolError::MaxDepth(_) => "max_depth_exceeded",
            _ => "tool_error",
        }
    }
}
