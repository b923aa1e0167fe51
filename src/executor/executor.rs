use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use indoc::formatdoc;

use crate::agent::{Agent, OutputMode};
use crate::composer::Composer;
use crate::lang::{analyze, parse, Ctl, EvalError, Interp, Signal, ToolExec, Value, ValueMap};
use crate::llm::{chat_with_retry, ChatRequest, ChatResponse, Llm, LlmBinding, LlmError};
use crate::render::{firewalled, Coalesced, Compression, RenderInput, RenderOpts};
use crate::schemas::{Fail, Message, Step, TraceContext, Turn, TurnType, Usage};
use crate::signature::{validate, Signature};
use crate::telemetry::{Fields, Telemetry};
use crate::template::{Template, TemplateError};
use crate::tools::{register_grep_tools, register_llm_query, Dispatcher, RecursionEnv};

use super::{extract_code, json_mode, text_mode, BudgetState, RunOptions, TraceMode, TurnBudget};

/// Runs an agent to completion and returns its immutable [`Step`]. All
/// failures, including configuration problems discovered mid-run, surface
/// as `Step.fail` rather than an `Err`.
pub async fn run(agent: impl Into<Arc<Agent>>, opts: RunOptions) -> Step {
    let agent = agent.into();
    let started = Instant::now();
    let trace = opts.trace_context.clone().unwrap_or_default();
    let telemetry = Telemetry::new(opts.telemetry.iter().cloned().collect());
    let run_span = telemetry.span(
        &trace,
        "run",
        Fields::new()
            .with("mode", format!("{:?}", agent.output_mode))
            .with("depth", trace.depth),
    );

    let mut session = Session {
        agent: agent.clone(),
        opts,
        telemetry,
        trace: run_span.child_context(),
        llm: None,
        usage: Usage::default(),
        turns: Vec::new(),
        collected: Vec::new(),
    };

    let outcome = match session.resolve_llm() {
        Ok(()) => match agent.output_mode {
            OutputMode::Dsl => run_dsl(&mut session).await,
            OutputMode::Json => json_mode::run_json(&mut session).await,
            OutputMode::Text => text_mode::run_text(&mut session).await,
        },
        Err(e) => ModeOutcome::Fail(Fail::new(e.reason(), e.to_string()), HashMap::new()),
    };

    let (return_value, fail, memory) = match outcome {
        ModeOutcome::Return(value, memory) => (Some(value), None, memory),
        ModeOutcome::Fail(fail, memory) => (None, Some(fail), memory),
    };

    let keep_turns = match session.opts.trace {
        TraceMode::On => true,
        TraceMode::Off => false,
        TraceMode::OnError => fail.is_some(),
    };
    let mut usage = session.usage;
    usage.duration_ms = started.elapsed().as_millis() as u64;
    usage.turns = session.turns.len() as u32;

    let step = Step {
        return_value,
        fail,
        memory,
        turns: keep_turns.then_some(session.turns),
        messages: session.opts.collect_messages.then_some(session.collected),
        usage,
    };

    let step_json = serde_json::to_value(&step).unwrap_or_default();
    if step.success() {
        run_span.stop(
            Fields::new()
                .with("step", step_json)
                .with(
                    "return",
                    step.return_value
                        .as_ref()
                        .map(Value::summarize)
                        .unwrap_or_default(),
                ),
        );
    } else {
        run_span.exception(
            Fields::new().with("step", step_json).with(
                "reason",
                step.fail
                    .as_ref()
                    .map(|f| f.reason.clone())
                    .unwrap_or_default(),
            ),
        );
    }
    step
}

/// Mutable state shared by the three output modes.
pub(crate) struct Session {
    pub agent: Arc<Agent>,
    pub opts: RunOptions,
    pub telemetry: Telemetry,
    /// Trace context parented under the run span.
    pub trace: TraceContext,
    pub llm: Option<Arc<dyn Llm>>,
    pub usage: Usage,
    pub turns: Vec<Turn>,
    pub collected: Vec<Message>,
}

pub(crate) enum ModeOutcome {
    Return(Value, HashMap<String, Value>),
    Fail(Fail, HashMap<String, Value>),
}

impl Session {
    fn resolve_llm(&mut self) -> Result<(), LlmError> {
        let binding = self
            .agent
            .llm
            .clone()
            .or_else(|| self.opts.llm.clone())
            .ok_or_else(|| LlmError::Transport("no LLM bound for this run".into()))?;
        self.llm = Some(binding.resolve(self.opts.llm_registry.as_deref())?);
        Ok(())
    }

    pub fn llm(&self) -> Arc<dyn Llm> {
        self.llm.clone().expect("resolved before mode dispatch")
    }

    /// Calls the LLM under a span with the configured retry policy,
    /// accumulating request and token counts. Retries never count as turns.
    pub async fn chat(
        &mut self,
        request: ChatRequest,
        parent: &TraceContext,
    ) -> Result<ChatResponse, LlmError> {
        let span = self.telemetry.span(
            parent,
            "llm",
            Fields::new().with("turn", request.turn),
        );
        let llm = self.llm();
        let (result, requests) =
            chat_with_retry(llm.as_ref(), request, &self.agent.llm_retry).await;
        self.usage.llm_requests += requests;
        match &result {
            Ok(response) => {
                self.usage.input_tokens += response.tokens.input;
                self.usage.output_tokens += response.tokens.output;
                self.usage.cache_creation_tokens += response.tokens.cache_creation;
                self.usage.cache_read_tokens += response.tokens.cache_read;
                span.stop(
                    Fields::new()
                        .with("requests", requests)
                        .with("input_tokens", response.tokens.input)
                        .with("output_tokens", response.tokens.output),
                );
            }
            Err(e) => span.exception(Fields::new().with("error", e.to_string())),
        }
        result
    }

    pub fn collect_exchange(&mut self, request: &ChatRequest, reply: &Message) {
        if !self.opts.collect_messages {
            return;
        }
        if self.collected.is_empty() {
            self.collected.push(Message::system(request.system.clone()));
        }
        self.collected.extend(request.messages.iter().cloned());
        self.collected.push(reply.clone());
    }

    /// Expands `{{var}}` placeholders in the mission against the run
    /// context, redacting firewalled values.
    pub fn expand_mission(&self) -> Result<String, Fail> {
        let redacted: HashMap<String, Value> = self
            .opts
            .context
            .iter()
            .map(|(k, v)| {
                if firewalled(k) {
                    (k.clone(), Value::Str("<Firewalled>".into()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect();
        let template = Template::parse(&self.agent.prompt)
            .map_err(|e| Fail::new("placeholder_missing", e.to_string()))?;
        template.render(&redacted).map_err(|e| match e {
            TemplateError::MissingVariable(name) => Fail::new(
                "placeholder_missing",
                format!("mission placeholder '{{{{{name}}}}}' has no value in the context"),
            ),
            other => Fail::new("placeholder_missing", other.to_string()),
        })
    }
}

enum TurnEval {
    Flow(Ctl),
    EvalErr(EvalError),
    /// Parse or analyze failure; these count as invalid returns for the
    /// retry budget.
    SyntaxErr(String),
}

enum Classified {
    Success(Value),
    Failed(Fail),
    Continue {
        feedback: String,
    },
}

async fn run_dsl(session: &mut Session) -> ModeOutcome {
    let agent = session.agent.clone();
    let limits = agent.limits.clone();

    let mut toolset = agent.tools.clone();
    if agent.grep_tools {
        register_grep_tools(&mut toolset);
    }
    if agent.llm_query {
        register_llm_query(&mut toolset, session.llm());
    }

    let turn_budget = session
        .opts
        .turn_budget
        .clone()
        .unwrap_or_else(TurnBudget::unlimited);
    let dispatcher = Arc::new(
        Dispatcher::new(toolset.clone(), limits.timeout, limits.max_tool_calls)
            .with_telemetry(session.telemetry.clone(), session.trace.clone())
            .with_recursion(RecursionEnv {
                self_agent: Some(agent.clone()),
                llm: Some(LlmBinding::Shared(session.llm())),
                registry: session.opts.llm_registry.clone(),
                turn_budget: turn_budget.clone(),
                max_depth: limits.max_depth,
                compression: session
                    .opts
                    .compression
                    .clone()
                    .or_else(|| agent.compression.clone()),
                sinks: session.opts.telemetry.clone(),
            }),
    );

    let mission = match session.expand_mission() {
        Ok(mission) => mission,
        Err(fail) => return ModeOutcome::Fail(fail, HashMap::new()),
    };

    let mut interp = Interp::new(session.opts.context.clone());
    interp.tools = Some(dispatcher.clone() as Arc<dyn ToolExec>);
    interp.pmap_timeout = limits.pmap_timeout;
    interp.loop_limit = limits.loop_limit;
    // :self inheritance: the parent's closure-valued bindings seed memory.
    interp
        .memory
        .extend(session.opts.inherited_closures.clone());

    let strategy: Arc<dyn Compression> = session
        .opts
        .compression
        .clone()
        .or_else(|| agent.compression.clone())
        .unwrap_or_else(|| Arc::new(Coalesced));
    let render_opts = RenderOpts::default();

    let composer = Composer {
        signature: agent.signature.as_ref(),
        toolset: &toolset,
        multi_turn: agent.multi_turn(),
        journaling: agent.journaling,
        customize: &agent.customize,
        max_chars: agent.max_chars,
    };
    let system_prompt = composer.system_prompt();

    let mut budget = BudgetState::new(limits.max_turns, limits.retry_turns);
    let mut feedback: Option<String> = None;
    let mut turn_number: u32 = 0;

    loop {
        let Some(turn_type) = budget.next_turn_type() else {
            let message = match &feedback {
                Some(feedback) => format!("turn budget exhausted; last issue: {feedback}"),
                None => "turn budget exhausted".to_string(),
            };
            return ModeOutcome::Fail(
                Fail::new(budget.exhaustion_reason(), message),
                interp.memory.clone(),
            );
        };
        if !turn_budget.try_consume() {
            return ModeOutcome::Fail(
                Fail::new(
                    "turn_budget_exhausted",
                    "the cross-agent turn budget is spent",
                ),
                interp.memory.clone(),
            );
        }
        turn_number += 1;
        let tools_enabled = turn_type == TurnType::Normal && toolset.has_callable();

        interp.budget = budget_snapshot(&budget, &session.trace, &limits, dispatcher.calls_made());

        let input = RenderInput {
            mission: &mission,
            turns: &session.turns,
            memory: &interp.memory,
            feedback: feedback.as_deref(),
            turns_left: budget.work_left,
            must_return: turn_type == TurnType::MustReturn,
            retry: turn_type == TurnType::Retry,
        };
        // Retry turns always coalesce to a single USER message, whatever
        // strategy the run uses.
        let mut messages = if turn_type == TurnType::Retry {
            Coalesced.to_messages(&input, &render_opts)
        } else {
            strategy.to_messages(&input, &render_opts)
        };
        let context_block = composer.context_block(&session.opts.context, tools_enabled);
        if !context_block.is_empty() {
            if let Some(first) = messages.first_mut() {
                first.content = format!("{context_block}\n\n{}", first.content);
            }
        }

        let mut request = ChatRequest::new(system_prompt.clone(), messages, turn_number);
        if tools_enabled {
            request.tool_names = toolset.names().iter().map(|s| s.to_string()).collect();
        }

        let turn_span = session.telemetry.span(
            &session.trace,
            "turn",
            Fields::new()
                .with("turn", turn_number)
                .with("type", turn_type.to_string()),
        );
        dispatcher.set_trace(turn_span.child_context());

        let response = match session.chat(request.clone(), &turn_span.child_context()).await {
            Ok(response) => response,
            Err(e) => {
                turn_span.exception(Fields::new().with("error", e.to_string()));
                return ModeOutcome::Fail(
                    Fail::new(e.reason(), e.to_string()),
                    interp.memory.clone(),
                );
            }
        };
        session.collect_exchange(&request, &Message::assistant(response.content.clone()));

        let program = extract_code(&response.content);
        let eval_result = evaluate_program(&mut interp, &program).await;

        let prints = std::mem::take(&mut interp.prints);
        let tool_calls = dispatcher.drain_records();

        let (classified, result, error) = match eval_result {
            TurnEval::Flow(Ctl::Signal(Signal::Return(value))) => {
                match check_signature(agent.signature.as_ref(), &value) {
                    None => (Classified::Success(value.clone()), Some(value), None),
                    Some(violations) => {
                        let feedback = formatdoc! {"
                            The returned value does not match the expected type:
                            {violations}
                            Respond with a corrected (return ...)."};
                        (
                            Classified::Continue { feedback },
                            Some(value),
                            Some(format!("validation_error: {violations}")),
                        )
                    }
                }
            }
            TurnEval::Flow(Ctl::Signal(Signal::Fail(value))) => {
                let fail = fail_from_value(value.clone());
                (Classified::Failed(fail), Some(value), None)
            }
            TurnEval::Flow(Ctl::Value(value)) => {
                interp.history.insert(0, value.clone());
                interp.history.truncate(3);
                match agent.signature.as_ref() {
                    // Single-shot recovery: the bare expression value may
                    // already satisfy the contract.
                    Some(signature) if validate(&signature.ret, &value).is_empty() => {
                        (Classified::Success(value.clone()), Some(value), None)
                    }
                    _ => (
                        Classified::Continue {
                            feedback: "Mission still active; no (return ...) yet.".to_string(),
                        },
                        Some(value),
                        None,
                    ),
                }
            }
            TurnEval::Flow(Ctl::Recur(_)) => {
                let message = "recur escaped its loop".to_string();
                (
                    Classified::Continue {
                        feedback: message.clone(),
                    },
                    None,
                    Some(message),
                )
            }
            TurnEval::EvalErr(e) => {
                let message = format!("{}: {e}", e.reason());
                (
                    Classified::Continue {
                        feedback: message.clone(),
                    },
                    None,
                    Some(message),
                )
            }
            TurnEval::SyntaxErr(message) => (
                Classified::Continue {
                    feedback: message.clone(),
                },
                None,
                Some(message),
            ),
        };

        // An explicit (fail ...) is still a successfully executed program.
        let success = error.is_none();
        let turn = Turn {
            number: turn_number,
            turn_type,
            program: program.clone(),
            result: result.filter(|_| success),
            error,
            prints,
            tool_calls,
            memory: interp.memory.clone(),
            success,
        };
        turn_span.stop(
            Fields::new()
                .with("type", turn_type.to_string())
                .with("program", preview(&program))
                .with(
                    "result",
                    turn.result.as_ref().map(Value::summarize).unwrap_or_default(),
                )
                .with("prints", turn.prints.len())
                .with("tool_calls", turn.tool_calls.len())
                .with("success", turn.success),
        );
        session.turns.push(turn);
        budget.consume(turn_type);

        match classified {
            Classified::Success(value) => {
                return ModeOutcome::Return(value, interp.memory.clone());
            }
            Classified::Failed(fail) => {
                return ModeOutcome::Fail(fail, interp.memory.clone());
            }
            Classified::Continue { feedback: f } => {
                log::debug!("turn {turn_number} continues: {f}");
                feedback = Some(f);
            }
        }
    }
}

async fn evaluate_program(interp: &mut Interp, source: &str) -> TurnEval {
    let sexp = match parse(source) {
        Ok(sexp) => sexp,
        Err(e) => return TurnEval::SyntaxErr(format!("parse_error: {e}")),
    };
    let node = match analyze(&sexp) {
        Ok(node) => node,
        Err(e) => return TurnEval::SyntaxErr(format!("analyze_error: {e}")),
    };
    match interp.run(&node).await {
        Ok(ctl) => TurnEval::Flow(ctl),
        Err(e) => TurnEval::EvalErr(e),
    }
}

/// None when valid; otherwise the newline-joined violation list.
fn check_signature(signature: Option<&Signature>, value: &Value) -> Option<String> {
    let signature = signature?;
    let violations = validate(&signature.ret, value);
    if violations.is_empty() {
        return None;
    }
    Some(
        violations
            .iter()
            .map(|v| format!("- {v}"))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

fn fail_from_value(value: Value) -> Fail {
    if let Value::Map(map) = &value {
        let reason = map
            .get(&Value::Keyword("reason".into()))
            .map(|v| v.as_json_key())
            .unwrap_or_else(|| "failed".into());
        let message = map
            .get(&Value::Keyword("message".into()))
            .map(|v| v.to_string())
            .unwrap_or_else(|| value.pr());
        return Fail {
            reason,
            message,
            details: Some(value),
        };
    }
    Fail::new("failed", value.to_string()).with_details(value)
}

fn budget_snapshot(
    budget: &BudgetState,
    trace: &TraceContext,
    limits: &crate::agent::Limits,
    calls_made: usize,
) -> ValueMap {
    let mut snapshot = ValueMap::new();
    snapshot.insert(
        Value::Keyword("turns_left".into()),
        Value::Int(budget.work_left as i64),
    );
    snapshot.insert(
        Value::Keyword("retry_turns_left".into()),
        Value::Int(budget.retry_left as i64),
    );
    snapshot.insert(
        Value::Keyword("depth_left".into()),
        Value::Int(limits.max_depth.saturating_sub(trace.depth) as i64),
    );
    snapshot.insert(
        Value::Keyword("tool_calls_left".into()),
        Value::Int(limits.max_tool_calls.saturating_sub(calls_made) as i64),
    );
    snapshot
}

pub(crate) fn preview(text: &str) -> String {
    const MAX: usize = 400;
    if text.chars().count() > MAX {
        let cut: String = text.chars().take(MAX).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}
