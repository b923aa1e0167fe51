use std::collections::HashMap;
use std::sync::Arc;

use indoc::formatdoc;
use serde_json::json;

use crate::lang::{CallerInfo, ToolExec, Value};
use crate::llm::{ChatRequest, LlmBinding};
use crate::schemas::{Fail, Message, Turn, TurnType};
use crate::signature::{params_schema, return_schema, validate, Prim, SigType};
use crate::telemetry::Fields;
use crate::tools::{register_grep_tools, Dispatcher, RecursionEnv, Toolset};

use super::executor::{preview, ModeOutcome, Session};
use super::extract_json;
use super::TurnBudget;

/// Text output mode. Two sub-modes, auto-selected: without tools the prompt
/// is a one-shot (plain text, or JSON with validation retries); with tools
/// the provider's native tool-call API drives a bounded round loop.
pub(crate) async fn run_text(session: &mut Session) -> ModeOutcome {
    let rendered = match session.expand_mission() {
        Ok(rendered) => rendered,
        Err(fail) => return ModeOutcome::Fail(fail, HashMap::new()),
    };

    let mut toolset = session.agent.tools.clone();
    if session.agent.grep_tools {
        register_grep_tools(&mut toolset);
    }
    if toolset.has_callable() {
        run_tool_calling(session, rendered, toolset).await
    } else {
        run_plain(session, rendered).await
    }
}

/// String (or absent) return types take the raw reply; anything else goes
/// through JSON parse + validation with corrective retries.
async fn run_plain(session: &mut Session, rendered: String) -> ModeOutcome {
    let agent = session.agent.clone();
    let wants_text = wants_raw_text(&agent.signature);
    let system = agent.customize.apply(String::new());

    let mut messages = vec![Message::user(rendered)];
    let mut last_reason = "max_turns_exceeded";
    let mut last_message = "ran out of turns".to_string();

    for turn_number in 1..=agent.limits.max_turns {
        let mut request = ChatRequest::new(system.clone(), messages.clone(), turn_number);
        if !wants_text {
            request.output = Some(crate::llm::OutputFormat::Json);
            request.schema = agent.signature.as_ref().map(return_schema);
        }

        let turn_span = session.telemetry.span(
            &session.trace,
            "turn",
            Fields::new().with("turn", turn_number).with("mode", "text"),
        );
        let response = match session.chat(request.clone(), &turn_span.child_context()).await {
            Ok(response) => response,
            Err(e) => {
                turn_span.exception(Fields::new().with("error", e.to_string()));
                return ModeOutcome::Fail(Fail::new(e.reason(), e.to_string()), HashMap::new());
            }
        };
        session.collect_exchange(&request, &Message::assistant(response.content.clone()));

        let (value, error, correction) = if wants_text {
            (Some(Value::Str(response.content.trim().to_string())), None, None)
        } else {
            parse_and_validate(session, &response.content)
        };
        if let Some((reason, message)) = &error {
            last_reason = reason;
            last_message = message.clone();
        }

        let success = error.is_none();
        let turn = Turn {
            number: turn_number,
            turn_type: TurnType::Normal,
            program: response.content.clone(),
            result: value.clone().filter(|_| success),
            error: error.map(|(reason, message)| format!("{reason}: {message}")),
            prints: vec![],
            tool_calls: vec![],
            memory: HashMap::new(),
            success,
        };
        turn_span.stop(Fields::new().with("success", success));
        session.turns.push(turn);

        if success {
            return ModeOutcome::Return(value.unwrap_or(Value::Nil), HashMap::new());
        }
        if let Some(correction) = correction {
            messages.push(Message::assistant(response.content));
            messages.push(Message::user(correction));
        }
    }

    ModeOutcome::Fail(Fail::new(last_reason, last_message), HashMap::new())
}

/// Native tool-calling loop: each round the LLM either answers or requests
/// tool calls, which run sequentially and are fed back as tool messages.
async fn run_tool_calling(
    session: &mut Session,
    rendered: String,
    toolset: Toolset,
) -> ModeOutcome {
    let agent = session.agent.clone();
    let limits = agent.limits.clone();
    let wants_text = wants_raw_text(&agent.signature);

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
                compression: session.opts.compression.clone(),
                sinks: session.opts.telemetry.clone(),
            }),
    );

    let tool_schemas: Vec<serde_json::Value> = toolset
        .names()
        .iter()
        .filter_map(|name| {
            let entry = toolset.get(name)?;
            let parameters = entry
                .effective_signature()
                .map(|s| params_schema(&s))
                .unwrap_or_else(|| json!({"type": "object"}));
            Some(json!({
                "name": name,
                "description": entry.effective_description(),
                "parameters": parameters,
            }))
        })
        .collect();

    let system = agent.customize.apply(String::new());
    let mut messages = vec![Message::user(rendered)];
    let mut last_reason = "max_turns_exceeded";
    let mut last_message = "ran out of turns".to_string();

    for turn_number in 1..=limits.max_turns {
        if !turn_budget.try_consume() {
            return ModeOutcome::Fail(
                Fail::new(
                    "turn_budget_exhausted",
                    "the cross-agent turn budget is spent",
                ),
                HashMap::new(),
            );
        }

        let mut request = ChatRequest::new(system.clone(), messages.clone(), turn_number);
        request.tools = Some(tool_schemas.clone());
        request.tool_names = toolset.names().iter().map(|s| s.to_string()).collect();

        let turn_span = session.telemetry.span(
            &session.trace,
            "turn",
            Fields::new()
                .with("turn", turn_number)
                .with("mode", "text-tools"),
        );
        dispatcher.set_trace(turn_span.child_context());

        let response = match session.chat(request.clone(), &turn_span.child_context()).await {
            Ok(response) => response,
            Err(e) => {
                turn_span.exception(Fields::new().with("error", e.to_string()));
                return ModeOutcome::Fail(Fail::new(e.reason(), e.to_string()), HashMap::new());
            }
        };

        if !response.tool_calls.is_empty() {
            let assistant = Message::assistant(response.content.clone())
                .with_tool_calls(response.tool_calls.clone());
            session.collect_exchange(&request, &assistant);
            messages.push(assistant);

            for call in &response.tool_calls {
                let content = match dispatcher
                    .dispatch(&call.name, call.arguments.clone(), CallerInfo::default())
                    .await
                {
                    Ok(value) => value.to_json().to_string(),
                    Err(e) => format!("Tool call failed: {e}"),
                };
                messages.push(Message::tool(call.id.clone(), content));
            }

            let turn = Turn {
                number: turn_number,
                turn_type: TurnType::Normal,
                program: format!(
                    "tool calls: {}",
                    response
                        .tool_calls
                        .iter()
                        .map(|c| c.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                result: None,
                error: None,
                prints: vec![],
                tool_calls: dispatcher.drain_records(),
                memory: HashMap::new(),
                success: true,
            };
            turn_span.stop(Fields::new().with("tool_calls", turn.tool_calls.len()));
            session.turns.push(turn);
            continue;
        }

        session.collect_exchange(&request, &Message::assistant(response.content.clone()));

        let (value, error, correction) = if wants_text {
            (Some(Value::Str(response.content.trim().to_string())), None, None)
        } else {
            parse_and_validate(session, &response.content)
        };
        if let Some((reason, message)) = &error {
            last_reason = reason;
            last_message = message.clone();
        }

        let success = error.is_none();
        let turn = Turn {
            number: turn_number,
            turn_type: TurnType::Normal,
            program: response.content.clone(),
            result: value.clone().filter(|_| success),
            error: error.map(|(reason, message)| format!("{reason}: {message}")),
            prints: vec![],
            tool_calls: dispatcher.drain_records(),
            memory: HashMap::new(),
            success,
        };
        turn_span.stop(
            Fields::new()
                .with("program", preview(&response.content))
                .with("success", success),
        );
        session.turns.push(turn);

        if success {
            return ModeOutcome::Return(value.unwrap_or(Value::Nil), HashMap::new());
        }
        if let Some(correction) = correction {
            messages.push(Message::assistant(response.content));
            messages.push(Message::user(correction));
        }
    }

    ModeOutcome::Fail(Fail::new(last_reason, last_message), HashMap::new())
}

fn wants_raw_text(signature: &Option<crate::signature::Signature>) -> bool {
    match signature {
        None => true,
        Some(signature) => matches!(
            &signature.ret,
            SigType::Primitive {
                prim: Prim::Str | Prim::Any,
                ..
            }
        ),
    }
}

type Parsed = (
    Option<Value>,
    Option<(&'static str, String)>,
    Option<String>,
);

/// Parses a JSON reply and validates it against the signature. Returns
/// (value, error, corrective message).
fn parse_and_validate(session: &Session, content: &str) -> Parsed {
    match extract_json(content) {
        Err(e) => (
            None,
            Some(("json_parse_error", e.to_string())),
            Some(format!(
                "Your reply was not valid JSON ({e}). Reply with a single JSON document."
            )),
        ),
        Ok(parsed) => {
            let value = Value::from_json(&parsed);
            let violations: Vec<String> = session
                .agent
                .signature
                .as_ref()
                .map(|s| validate(&s.ret, &value))
                .unwrap_or_default()
                .iter()
                .map(|v| format!("- {v}"))
                .collect();
            if violations.is_empty() {
                (Some(value), None, None)
            } else {
                let joined = violations.join("\n");
                let correction = formatdoc! {"
                    The JSON does not match the expected type:
                    {joined}"};
                (
                    Some(value),
                    Some(("validation_error", joined)),
                    Some(correction),
                )
            }
        }
    }
}
