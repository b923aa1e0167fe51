use std::collections::HashMap;
use std::sync::Arc;

use crate::lang::Value;
use crate::llm::{LlmBinding, LlmRegistry};
use crate::render::Compression;
use crate::schemas::TraceContext;
use crate::telemetry::TelemetrySink;

use super::TurnBudget;

/// Whether per-turn records are kept on the resulting step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceMode {
    #[default]
    On,
    Off,
    /// Keep turns only when the run fails.
    OnError,
}

/// Per-run inputs: the ambient data context plus everything inherited from
/// the process or a parent agent.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Fallback LLM binding when the agent does not carry its own.
    pub llm: Option<LlmBinding>,
    /// Ambient data, visible as `data/name`. Keys starting with `_` are
    /// firewalled: evaluator-visible, redacted for the LLM.
    pub context: HashMap<String, Value>,
    pub llm_registry: Option<Arc<LlmRegistry>>,
    pub trace_context: Option<TraceContext>,
    /// Overrides the agent's compression strategy.
    pub compression: Option<Arc<dyn Compression>>,
    pub telemetry: Vec<Arc<dyn TelemetrySink>>,
    pub trace: TraceMode,
    /// Keep the full LLM exchange on the step.
    pub collect_messages: bool,
    /// Cross-agent turn budget shared with children.
    pub turn_budget: Option<TurnBudget>,
    /// Closure bindings seeded into a `:self` child's memory.
    pub inherited_closures: HashMap<String, Value>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm(mut self, llm: impl Into<LlmBinding>) -> Self {
        self.llm = Some(llm.into());
        self
    }

    pub fn with_context(mut self, context: HashMap<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_registry(mut self, registry: Arc<LlmRegistry>) -> Self {
        self.llm_registry = Some(registry);
        self
    }

    pub fn with_trace_context(mut self, trace: TraceContext) -> Self {
        self.trace_context = Some(trace);
        self
    }

    pub fn with_compression(mut self, strategy: impl Compression + 'static) -> Self {
        self.compression = Some(Arc::new(strategy));
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry.push(sink);
        self
    }

    pub fn with_trace_mode(mut self, mode: TraceMode) -> Self {
        self.trace = mode;
        self
    }

    pub fn collect_messages(mut self) -> Self {
        self.collect_messages = true;
        self
    }

    pub fn with_turn_budget(mut self, turns: u32) -> Self {
        self.turn_budget = Some(TurnBudget::limited(turns));
        self
    }
}
