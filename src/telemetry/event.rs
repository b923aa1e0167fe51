use serde::Serialize;
use serde_json::Value as JsonValue;

/// Namespace prefix shared by every emitted event.
pub const EVENT_NAMESPACE: &str = "subagent";

/// A single telemetry emission, e.g. `subagent.tool.stop`.
///
/// `span_id` / `parent_span_id` come from the active span context, so nested
/// spans correlate deterministically.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub fields: serde_json::Map<String, JsonValue>,
}

impl TelemetryEvent {
    pub fn field(&self, key: &str) -> Option<&JsonValue> {
        self.fields.get(key)
    }
}

/// Convenience builder for event field maps.
#[derive(Debug, Default, Clone)]
pub struct Fields(serde_json::Map<String, JsonValue>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn into_map(self) -> serde_json::Map<String, JsonValue> {
        self.0
    }
}
