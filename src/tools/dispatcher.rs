use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::agent::Agent;
use crate::executor::{RunOptions, TurnBudget};
use crate::lang::{CallerInfo, EvalError, ToolExec, Value};
use crate::llm::{LlmBinding, LlmRegistry};
use crate::render::Compression;
use crate::schemas::{ToolCallRecord, TraceContext};
use crate::telemetry::{Fields, Telemetry, TelemetrySink};

use super::{Tool, ToolEntry, ToolError, ToolHandler, Toolset};

/// Everything a nested or recursive agent run inherits from its caller.
#[derive(Clone)]
pub struct RecursionEnv {
    pub self_agent: Option<Arc<Agent>>,
    pub llm: Option<LlmBinding>,
    pub registry: Option<Arc<LlmRegistry>>,
    pub turn_budget: TurnBudget,
    pub max_depth: u32,
    pub compression: Option<Arc<dyn Compression>>,
    pub sinks: Vec<Arc<dyn TelemetrySink>>,
}

#[derive(Default)]
struct DispatchState {
    cache: HashMap<String, Value>,
    calls_made: usize,
    records: Vec<ToolCallRecord>,
}

/// Per-run tool dispatcher: name resolution, argument-normalized caching,
/// call caps, timeouts, telemetry, and recursion into nested agents.
///
/// Shared between the evaluator and its parallel workers; internal state is
/// mutex-confined.
pub struct Dispatcher {
    toolset: Toolset,
    timeout: Duration,
    max_tool_calls: usize,
    telemetry: Telemetry,
    trace: Mutex<TraceContext>,
    state: Mutex<DispatchState>,
    recursion: Option<RecursionEnv>,
}

impl Dispatcher {
    pub fn new(toolset: Toolset, timeout: Duration, max_tool_calls: usize) -> Self {
        Self {
            toolset,
            timeout,
            max_tool_calls,
            telemetry: Telemetry::disabled(),
            trace: Mutex::new(TraceContext::root()),
            state: Mutex::new(DispatchState::default()),
            recursion: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry, trace: TraceContext) -> Self {
        self.telemetry = telemetry;
        self.trace = Mutex::new(trace);
        self
    }

    pub fn with_recursion(mut self, recursion: RecursionEnv) -> Self {
        self.recursion = Some(recursion);
        self
    }

    /// Re-parents subsequent tool spans; the loop calls this as each turn
    /// span opens.
    pub fn set_trace(&self, trace: TraceContext) {
        if let Ok(mut current) = self.trace.lock() {
            *current = trace;
        }
    }

    /// Drains the tool-call records accumulated since the last drain.
    pub fn drain_records(&self) -> Vec<ToolCallRecord> {
        self.state
            .lock()
            .map(|mut s| std::mem::take(&mut s.records))
            .unwrap_or_default()
    }

    pub fn calls_made(&self) -> usize {
        self.state.lock().map(|s| s.calls_made).unwrap_or(0)
    }

    async fn execute(
        &self,
        name: &str,
        args: &JsonValue,
        caller: CallerInfo,
    ) -> Result<Value, ToolError> {
        if self.toolset.is_catalog_only(name) {
            return Err(ToolError::CatalogOnly(name.to_string()));
        }
        let Some(entry) = self.toolset.get(name) else {
            return Err(ToolError::NotFound(name.to_string()));
        };

        let cache_key = entry
            .cache
            .then(|| format!("{name}:{}", canonical(args)));
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache_get(key) {
                self.record(ToolCallRecord {
                    name: name.to_string(),
                    args: args.clone(),
                    result: hit.summarize(),
                    duration_ms: 0,
                    cached: true,
                    error: None,
                });
                return Ok(hit);
            }
        }

        {
            let Ok(mut state) = self.state.lock() else {
                return Err(ToolError::Execution("dispatcher state poisoned".into()));
            };
            if state.calls_made >= self.max_tool_calls {
                return Err(ToolError::CallLimit(self.max_tool_calls));
            }
            state.calls_made += 1;
        }

        let trace = self
            .trace
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();
        let span = self.telemetry.span(
            &trace,
            "tool",
            Fields::new()
                .with("tool", name)
                .with("args", Value::from_json(args).summarize()),
        );
        let started = Instant::now();

        let result = match &entry.handler {
            ToolHandler::Func(tool) => self.call_func(tool.as_ref(), args).await,
            ToolHandler::Agent(agent) => {
                self.call_agent(name, agent.clone(), args, &span.child_context(), HashMap::new())
                    .await
            }
            ToolHandler::SelfRef => match self.recursion.as_ref().and_then(|r| r.self_agent.clone())
            {
                Some(agent) => {
                    self.call_agent(name, agent, args, &span.child_context(), caller.closures)
                        .await
                }
                None => Err(ToolError::Execution(
                    "self-recursion is not available in this context".into(),
                )),
            },
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(value) => {
                span.stop(Fields::new().with("result", value.summarize()));
                if let Some(key) = cache_key {
                    self.cache_put(key, value.clone());
                }
                self.record(ToolCallRecord {
                    name: name.to_string(),
                    args: args.clone(),
                    result: value.summarize(),
                    duration_ms,
                    cached: false,
                    error: None,
                });
            }
            Err(e) => {
                span.exception(Fields::new().with("error", e.to_string()));
                self.record(ToolCallRecord {
                    name: name.to_string(),
                    args: args.clone(),
                    result: e.to_string(),
                    duration_ms,
                    cached: false,
                    error: Some(e.to_string()),
                });
            }
        }
        result
    }

    async fn call_func(&self, tool: &dyn Tool, args: &JsonValue) -> Result<Value, ToolError> {
        let call = tool.call(args.clone());
        let json = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result?,
            Err(_) => return Err(ToolError::Timeout(self.timeout)),
        };
        // `{"error": ...}` is the handler-level failure convention; any other
        // wrapper (including `{"ok": ...}`) passes through unchanged.
        if let JsonValue::Object(obj) = &json {
            if obj.len() == 1 {
                if let Some(reason) = obj.get("error") {
                    return Err(ToolError::Execution(
                        reason.as_str().map(str::to_string).unwrap_or_else(|| reason.to_string()),
                    ));
                }
            }
        }
        Ok(Value::from_json(&json))
    }

    async fn call_agent(
        &self,
        name: &str,
        agent: Arc<Agent>,
        args: &JsonValue,
        child_trace: &TraceContext,
        inherited_closures: HashMap<String, Value>,
    ) -> Result<Value, ToolError> {
        let Some(recursion) = &self.recursion else {
            return Err(ToolError::Execution(
                "nested agent runs are not available in this context".into(),
            ));
        };
        let child_trace = TraceContext {
            trace_id: child_trace.trace_id.clone(),
            parent_span_id: child_trace.parent_span_id.clone(),
            depth: child_trace.depth + 1,
        };
        if child_trace.depth > recursion.max_depth {
            return Err(ToolError::MaxDepth(recursion.max_depth));
        }

        let context = match args {
            JsonValue::Object(obj) => obj
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
            JsonValue::Null => HashMap::new(),
            other => HashMap::from([("input".to_string(), Value::from_json(other))]),
        };

        let opts = RunOptions {
            llm: recursion.llm.clone(),
            context,
            llm_registry: recursion.registry.clone(),
            trace_context: Some(child_trace.clone()),
            compression: recursion.compression.clone(),
            telemetry: recursion.sinks.clone(),
            turn_budget: Some(recursion.turn_budget.clone()),
            inherited_closures,
            ..RunOptions::default()
        };

        let step = crate::executor::run(agent, opts).await;
        match (step.return_value, step.fail) {
            (Some(value), _) => Ok(value),
            (None, Some(fail)) => Err(ToolError::NestedAgent {
                name: name.to_string(),
                message: format!("{} ({})", fail.message, fail.reason),
            }),
            (None, None) => Ok(Value::Nil),
        }
    }

    fn cache_get(&self, key: &str) -> Option<Value> {
        self.state.lock().ok()?.cache.get(key).cloned()
    }

    fn cache_put(&self, key: String, value: Value) {
        if let Ok(mut state) = self.state.lock() {
            state.cache.insert(key, value);
        }
    }

    fn record(&self, record: ToolCallRecord) {
        if let Ok(mut state) = self.state.lock() {
            state.records.push(record);
        }
    }
}

#[async_trait]
impl ToolExec for Dispatcher {
    async fn dispatch(
        &self,
        name: &str,
        args: JsonValue,
        caller: CallerInfo,
    ) -> Result<Value, EvalError> {
        self.execute(name, &args, caller)
            .await
            .map_err(|e| EvalError::Tool {
                reason: e.reason(),
                message: e.to_string(),
            })
    }
}

/// Canonical argument rendering for cache keys: object keys sort
/// deterministically through `serde_json`'s default map.
fn canonical(args: &JsonValue) -> String {
    serde_json::to_string(args).unwrap_or_default()
}
