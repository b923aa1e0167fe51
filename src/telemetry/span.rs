use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::schemas::TraceContext;

use super::{Fields, TelemetryEvent, TelemetrySink, EVENT_NAMESPACE};

/// Shared handle to the configured sinks. Cheap to clone; an empty handle
/// drops every event.
#[derive(Clone, Default)]
pub struct Telemetry {
    sinks: Arc<Vec<Arc<dyn TelemetrySink>>>,
}

impl Telemetry {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(&self) -> bool {
        !self.sinks.is_empty()
    }

    /// Opens a span of the given kind (`run`, `turn`, `llm`, `tool`) and
    /// emits its `.start` event.
    pub fn span(&self, trace: &TraceContext, kind: &str, fields: Fields) -> Span {
        let span = Span {
            telemetry: self.clone(),
            kind: kind.to_string(),
            trace_id: trace.trace_id.clone(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: trace.parent_span_id.clone(),
            depth: trace.depth,
            started: Instant::now(),
        };
        span.emit("start", fields);
        span
    }

    fn emit(&self, event: TelemetryEvent) {
        for sink in self.sinks.iter() {
            sink.emit(&event);
        }
    }
}

/// An open span. Consumed by [`Span::stop`] or [`Span::exception`].
pub struct Span {
    telemetry: Telemetry,
    kind: String,
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    depth: u32,
    started: Instant,
}

impl Span {
    pub fn id(&self) -> &str {
        &self.span_id
    }

    /// Trace context for work nested under this span (child agents, parallel
    /// workers).
    pub fn child_context(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id.clone(),
            parent_span_id: Some(self.span_id.clone()),
            depth: self.depth,
        }
    }

    pub fn stop(self, fields: Fields) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.emit("stop", fields.with("duration_ms", elapsed));
    }

    pub fn exception(self, fields: Fields) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.emit(
            "exception",
            fields.with("duration_ms", elapsed).with("kind", "error"),
        );
    }

    fn emit(&self, phase: &str, fields: Fields) {
        self.telemetry.emit(TelemetryEvent {
            name: format!("{EVENT_NAMESPACE}.{}.{phase}", self.kind),
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            parent_span_id: self.parent_span_id.clone(),
            fields: fields.into_map(),
        });
    }
}

/// Collects events in memory; handy in tests and notebooks.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: &TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_correlate_parent_and_child() {
        let sink = Arc::new(MemorySink::new());
        let telemetry = Telemetry::new(vec![sink.clone()]);
        let trace = TraceContext::root();

        let run = telemetry.span(&trace, "run", Fields::new());
        let run_id = run.id().to_string();
        let turn = telemetry.span(&run.child_context(), "turn", Fields::new());
        turn.stop(Fields::new());
        run.stop(Fields::new());

        let events = sink.events();
        assert_eq!(events.len(), 4);
        let turn_start = &events[1];
        assert_eq!(turn_start.name, "subagent.turn.start");
        assert_eq!(turn_start.parent_span_id.as_deref(), Some(run_id.as_str()));
        assert!(events[2].field("duration_ms").is_some());
    }
}
