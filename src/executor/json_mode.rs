use std::collections::HashMap;

use indoc::formatdoc;
use serde_json::json;

use crate::lang::Value;
use crate::llm::{ChatRequest, OutputFormat};
use crate::render::firewalled;
use crate::schemas::{Fail, Message, Turn, TurnType};
use crate::signature::{apply_descriptions, return_schema, validate};
use crate::telemetry::Fields;

use super::executor::{preview, ModeOutcome, Session};
use super::extract_json;

/// JSON output mode: the LLM returns structured JSON matching the
/// signature's schema directly. No tools, no memory, no programs; parse or
/// validation failures get corrective retries within `max_turns`.
pub(crate) async fn run_json(session: &mut Session) -> ModeOutcome {
    let agent = session.agent.clone();

    let mission = match session.expand_mission() {
        Ok(mission) => mission,
        Err(fail) => return ModeOutcome::Fail(fail, HashMap::new()),
    };

    let mut schema = agent
        .signature
        .as_ref()
        .map(return_schema)
        .unwrap_or_else(|| json!({}));
    apply_descriptions(&mut schema, &agent.field_descriptions);
    let schema_text =
        serde_json::to_string_pretty(&schema).unwrap_or_else(|_| schema.to_string());

    let system = agent.customize.apply(formatdoc! {"
        Return structured JSON matching this schema. Reply with the JSON document only.

        {schema_text}"});

    let mut user = mission;
    let data = data_as_json(&session.opts.context);
    if let Some(data) = data {
        user.push_str("\n\n## Data\n");
        user.push_str(&data);
    }

    let mut messages = vec![Message::user(user)];
    let mut last_reason = "max_turns_exceeded";
    let mut last_message = "ran out of turns".to_string();

    for turn_number in 1..=agent.limits.max_turns {
        if let Some(budget) = &session.opts.turn_budget {
            if !budget.try_consume() {
                return ModeOutcome::Fail(
                    Fail::new(
                        "turn_budget_exhausted",
                        "the cross-agent turn budget is spent",
                    ),
                    HashMap::new(),
                );
            }
        }

        let mut request = ChatRequest::new(system.clone(), messages.clone(), turn_number);
        request.output = Some(OutputFormat::Json);
        request.schema = Some(schema.clone());

        let turn_span = session.telemetry.span(
            &session.trace,
            "turn",
            Fields::new().with("turn", turn_number).with("mode", "json"),
        );
        let response = match session.chat(request.clone(), &turn_span.child_context()).await {
            Ok(response) => response,
            Err(e) => {
                turn_span.exception(Fields::new().with("error", e.to_string()));
                return ModeOutcome::Fail(Fail::new(e.reason(), e.to_string()), HashMap::new());
            }
        };
        session.collect_exchange(&request, &Message::assistant(response.content.clone()));

        let (outcome, result, error) = match extract_json(&response.content) {
            Err(e) => {
                last_reason = "json_parse_error";
                last_message = e.to_string();
                let correction = formatdoc! {"
                    Your reply was not valid JSON ({e}). Reply with a single JSON document matching this schema:
                    {schema_text}"};
                (Some(correction), None, Some(format!("json_parse_error: {e}")))
            }
            Ok(parsed) => {
                let value = Value::from_json(&parsed);
                let violations: Vec<String> = agent
                    .signature
                    .as_ref()
                    .map(|s| validate(&s.ret, &value))
                    .unwrap_or_default()
                    .iter()
                    .map(|v| format!("- {v}"))
                    .collect();
                if violations.is_empty() {
                    (None, Some(value), None)
                } else {
                    let joined = violations.join("\n");
                    last_reason = "validation_error";
                    last_message = joined.clone();
                    let correction = formatdoc! {"
                        The JSON does not match the schema:
                        {joined}

                        Schema:
                        {schema_text}"};
                    (
                        Some(correction),
                        Some(value),
                        Some(format!("validation_error: {joined}")),
                    )
                }
            }
        };

        let success = error.is_none();
        let turn = Turn {
            number: turn_number,
            turn_type: TurnType::Normal,
            program: response.content.clone(),
            result: result.clone().filter(|_| success),
            error,
            prints: vec![],
            tool_calls: vec![],
            memory: HashMap::new(),
            success,
        };
        turn_span.stop(
            Fields::new()
                .with("program", preview(&response.content))
                .with("success", success),
        );
        session.turns.push(turn);

        match outcome {
            None => {
                // Arrays are fine when the signature's return is a list; the
                // validator already settled that.
                return ModeOutcome::Return(result.unwrap_or(Value::Nil), HashMap::new());
            }
            Some(correction) => {
                messages.push(Message::assistant(response.content));
                messages.push(Message::user(correction));
            }
        }
    }

    ModeOutcome::Fail(Fail::new(last_reason, last_message), HashMap::new())
}

fn data_as_json(ctx: &HashMap<String, Value>) -> Option<String> {
    if ctx.is_empty() {
        return None;
    }
    let mut obj = serde_json::Map::new();
    let mut keys: Vec<&String> = ctx.keys().collect();
    keys.sort();
    for key in keys {
        let value = if firewalled(key) {
            json!("<Firewalled>")
        } else {
            ctx.get(key).map(Value::to_json).unwrap_or(json!(null))
        };
        obj.insert(key.clone(), value);
    }
    serde_json::to_string_pretty(&serde_json::Value::Object(obj)).ok()
}
