use super::TelemetryEvent;

/// Observability sinks are pluggable; the runtime emits typed events and
/// sinks decide where they go. Emission is synchronous; a sink that needs to
/// do I/O should enqueue internally.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent);
}

/// Default sink: forwards every event to the `log` facade at debug level.
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&self, event: &TelemetryEvent) {
        log::debug!(
            "{} span={} parent={} {}",
            event.name,
            event.span_id,
            event.parent_span_id.as_deref().unwrap_or("-"),
            serde_json::Value::Object(event.fields.clone())
        );
    }
}
