use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Span-correlation context carried across child agents and parallel
/// workers. Always passed explicitly; never read from ambient state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Recursion depth; the root run is 0.
    pub depth: u32,
}

impl TraceContext {
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            parent_span_id: None,
            depth: 0,
        }
    }

    /// Context for a child agent spawned from the span `parent_span_id`.
    pub fn child_of(&self, parent_span_id: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            parent_span_id: Some(parent_span_id.into()),
            depth: self.depth + 1,
        }
    }

    /// Same depth, new parent span; used when re-attaching inside parallel
    /// workers.
    pub fn with_parent(&self, parent_span_id: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            parent_span_id: Some(parent_span_id.into()),
            depth: self.depth,
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::root()
    }
}
