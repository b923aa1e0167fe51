use std::sync::Arc;

use serde_json::json;
use subagent::agent::{Agent, OutputMode};
use subagent::executor::{run, RunOptions};
use subagent::lang::{Value, ValueMap};
use subagent::llm::ScriptedLlm;
use subagent::schemas::ToolCallRequest;
use subagent::tools::FnTool;

fn kw_map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Keyword(k.to_string()), v))
            .collect::<ValueMap>(),
    )
}

#[tokio::test]
async fn json_mode_validates_and_retries() {
    let agent = Agent::builder()
        .prompt("Measure {{thing}}")
        .signature("(thing :string) -> {value :float}")
        .unwrap()
        .output_mode(OutputMode::Json)
        .max_turns(3)
        .build()
        .unwrap();
    let llm = Arc::new(
        ScriptedLlm::new()
            .reply("that would be about five")
            .reply(r#"{"value": "five"}"#)
            .reply(r#"{"value": 5.0}"#),
    );

    let step = run(
        agent,
        RunOptions::new()
            .with_llm(subagent::llm::LlmBinding::shared(llm.clone()))
            .with_value("thing", Value::Str("the mast".into())),
    )
    .await;

    assert_eq!(step.return_value, Some(kw_map(vec![("value", Value::Float(5.0))])));
    // No memory, no programs in JSON mode.
    assert!(step.memory.is_empty());
    let turns = step.turns.as_ref().unwrap();
    assert_eq!(turns.len(), 3);
    assert!(turns[0].error.as_deref().unwrap().contains("json_parse_error"));
    assert!(turns[1].error.as_deref().unwrap().contains("validation_error"));

    // The corrective message carries the schema and the violation.
    let corrective = &llm.requests()[2];
    let text: String = corrective
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(text.contains("does not match"));
    assert!(text.contains("number"));
}

#[tokio::test]
async fn json_mode_accepts_arrays_for_list_returns() {
    let agent = Agent::builder()
        .signature("[:int]")
        .unwrap()
        .output_mode(OutputMode::Json)
        .max_turns(1)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new().reply("```json\n[1, 2, 3]\n```");

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    assert_eq!(
        step.return_value,
        Some(Value::Vector(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
    );
}

#[tokio::test]
async fn json_mode_exhaustion_reports_last_error() {
    let agent = Agent::builder()
        .signature("{value :float}")
        .unwrap()
        .output_mode(OutputMode::Json)
        .max_turns(2)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply(r#"{"value": "a"}"#)
        .reply(r#"{"value": "b"}"#);

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    assert_eq!(step.fail.as_ref().unwrap().reason, "validation_error");
}

#[tokio::test]
async fn text_mode_plain_returns_raw_text() {
    let agent = Agent::builder()
        .prompt("Summarize {{topic}} in one line.")
        .signature("(topic :string) -> :string")
        .unwrap()
        .output_mode(OutputMode::Text)
        .max_turns(1)
        .build()
        .unwrap();
    let llm = Arc::new(ScriptedLlm::new().reply("Ropes hold the ship together."));

    let step = run(
        agent,
        RunOptions::new()
            .with_llm(subagent::llm::LlmBinding::shared(llm.clone()))
            .with_value("topic", Value::Str("rigging".into())),
    )
    .await;

    assert_eq!(
        step.return_value,
        Some(Value::Str("Ropes hold the ship together.".into()))
    );
    // The rendered prompt contains the substituted variable.
    let request = &llm.requests()[0];
    assert!(request.messages[0].content.contains("rigging"));
}

#[tokio::test]
async fn text_mode_sections_render_lists() {
    let agent = Agent::builder()
        .prompt("Rank these:\n{{#items}}- {{.}}\n{{/items}}{{^items}}(no items){{/items}}")
        .signature("(items [:string]) -> :string")
        .unwrap()
        .output_mode(OutputMode::Text)
        .max_turns(1)
        .build()
        .unwrap();
    let llm = Arc::new(ScriptedLlm::new().reply("ranked"));

    run(
        agent,
        RunOptions::new()
            .with_llm(subagent::llm::LlmBinding::shared(llm.clone()))
            .with_value(
                "items",
                Value::Vector(vec![Value::Str("a".into()), Value::Str("b".into())]),
            ),
    )
    .await;

    let prompt = &llm.requests()[0].messages[0].content;
    assert!(prompt.contains("- a"));
    assert!(prompt.contains("- b"));
    assert!(!prompt.contains("(no items)"));
}

#[tokio::test]
async fn text_mode_structured_returns_validate_json() {
    let agent = Agent::builder()
        .prompt("Count {{what}}")
        .signature("(what :string) -> {count :int}")
        .unwrap()
        .output_mode(OutputMode::Text)
        .max_turns(2)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("about ten")
        .reply(r#"{"count": 10}"#);

    let step = run(
        agent,
        RunOptions::new()
            .with_llm(llm)
            .with_value("what", Value::Str("sails".into())),
    )
    .await;

    assert_eq!(step.return_value, Some(kw_map(vec![("count", Value::Int(10))])));
}

#[tokio::test]
async fn text_mode_native_tool_calling_loop() {
    let agent = Agent::builder()
        .prompt("Answer using the lookup tool: {{q}}")
        .signature("(q :string) -> {answer :int}")
        .unwrap()
        .output_mode(OutputMode::Text)
        .max_turns(3)
        .tool(
            "lookup",
            FnTool::new("lookup", |args: serde_json::Value| async move {
                let key = args["key"].as_str().unwrap_or_default().to_string();
                Ok(json!({"key": key, "value": 42}))
            }),
        )
        .build()
        .unwrap();
    let llm = Arc::new(
        ScriptedLlm::new()
            .reply_tool_calls(vec![ToolCallRequest {
                id: "call_1".into(),
                name: "lookup".into(),
                arguments: json!({"key": "answer"}),
            }])
            .reply(r#"{"answer": 42}"#),
    );

    let step = run(
        agent,
        RunOptions::new()
            .with_llm(subagent::llm::LlmBinding::shared(llm.clone()))
            .with_value("q", Value::Str("what is the answer?".into())),
    )
    .await;

    assert_eq!(step.return_value, Some(kw_map(vec![("answer", Value::Int(42))])));
    let turns = step.turns.as_ref().unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].tool_calls.len(), 1);

    // The follow-up request carries the tool result back to the LLM.
    let followup = &llm.requests()[1];
    assert!(followup
        .messages
        .iter()
        .any(|m| m.role == subagent::schemas::Role::Tool && m.content.contains("42")));
    // Tool schemas were offered on the first request.
    assert!(llm.requests()[0].tools.is_some());
}
