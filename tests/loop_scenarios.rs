use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use subagent::agent::Agent;
use subagent::executor::{run, RunOptions};
use subagent::lang::{Value, ValueMap};
use subagent::llm::{Backoff, LlmError, RetryPolicy, ScriptedLlm};
use subagent::schemas::TurnType;
use subagent::telemetry::MemorySink;
use subagent::tools::{FnTool, ToolEntry, ToolError};

fn kw_map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Keyword(k.to_string()), v))
            .collect::<ValueMap>(),
    )
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: Backoff::Constant,
        base_delay: Duration::from_millis(1),
        jitter_factor: 0.0,
    }
}

#[tokio::test]
async fn single_shot_arithmetic() {
    let agent = Agent::builder()
        .prompt("What is 2+2?")
        .signature("() -> :int")
        .unwrap()
        .max_turns(1)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new().reply("```clojure\n(+ 2 2)\n```");

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    assert_eq!(step.return_value, Some(Value::Int(4)));
    assert!(step.fail.is_none());
    let turns = step.turns.as_ref().unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].turn_type, TurnType::MustReturn);
    assert_eq!(step.usage.turns, 1);
}

#[tokio::test]
async fn multi_turn_memory_and_context() {
    let agent = Agent::builder()
        .prompt("Double {{n}}")
        .signature("(n :int) -> {result :int}")
        .unwrap()
        .max_turns(2)
        .retry_turns(0)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("(def x (* 2 data/n))")
        .reply("(return {:result x})");

    let step = run(
        agent,
        RunOptions::new()
            .with_llm(llm)
            .with_value("n", Value::Int(5)),
    )
    .await;

    assert_eq!(step.return_value, Some(kw_map(vec![("result", Value::Int(10))])));
    let turns = step.turns.as_ref().unwrap();
    assert_eq!(turns[0].turn_type, TurnType::Normal);
    assert_eq!(turns[1].turn_type, TurnType::MustReturn);
    // Memory is accumulative across turns.
    assert_eq!(turns[1].memory.get("x"), Some(&Value::Int(10)));
    assert_eq!(step.memory.get("x"), Some(&Value::Int(10)));
}

#[tokio::test]
async fn validation_retry_then_success() {
    let agent = Agent::builder()
        .signature("{value :float}")
        .unwrap()
        .max_turns(1)
        .retry_turns(2)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("(return {:value \"bad\"})")
        .reply("(return {:value true})")
        .reply("(return {:value 1.0})");

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    assert_eq!(step.return_value, Some(kw_map(vec![("value", Value::Float(1.0))])));
    let turns = step.turns.as_ref().unwrap();
    assert_eq!(turns.len(), 3);
    let types: Vec<TurnType> = turns.iter().map(|t| t.turn_type).collect();
    assert_eq!(
        types,
        vec![TurnType::MustReturn, TurnType::Retry, TurnType::Retry]
    );
}

#[tokio::test]
async fn pmap_preserves_order_and_loses_prints() {
    let agent = Agent::builder()
        .signature("[:int]")
        .unwrap()
        .max_turns(1)
        .build()
        .unwrap();
    let llm =
        ScriptedLlm::new().reply("(pmap (fn [x] (do (println x) (* x x))) [1 2 3 4])");

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    assert_eq!(
        step.return_value,
        Some(Value::Vector(vec![
            Value::Int(1),
            Value::Int(4),
            Value::Int(9),
            Value::Int(16)
        ]))
    );
    assert!(step.turns.as_ref().unwrap()[0].prints.is_empty());
}

#[tokio::test]
async fn tool_error_recovery_with_telemetry() {
    let agent = Agent::builder()
        .signature("{recovered :bool}")
        .unwrap()
        .max_turns(3)
        .tool(
            "crash",
            FnTool::new("crash", |_args| async {
                Err::<serde_json::Value, _>(ToolError::Execution("kaboom".into()))
            }),
        )
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("(tool/crash {})")
        .reply("(return {:recovered true})");
    let sink = Arc::new(MemorySink::new());

    let step = run(
        agent,
        RunOptions::new().with_llm(llm).with_telemetry(sink.clone()),
    )
    .await;

    assert_eq!(
        step.return_value,
        Some(kw_map(vec![("recovered", Value::Bool(true))]))
    );
    let turns = step.turns.as_ref().unwrap();
    assert!(!turns[0].success);
    assert_eq!(turns[0].tool_calls.len(), 1);
    assert!(turns[0].tool_calls[0].error.as_deref().unwrap().contains("kaboom"));

    let events = sink.events();
    let exception = events
        .iter()
        .find(|e| e.name == "subagent.tool.exception")
        .expect("tool.exception event");
    assert_eq!(exception.field("kind").and_then(|v| v.as_str()), Some("error"));
}

#[tokio::test]
async fn llm_retry_on_rate_limit_does_not_consume_turns() {
    let agent = Agent::builder()
        .signature("{ok :bool}")
        .unwrap()
        .max_turns(1)
        .llm_retry(fast_retry(3))
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply_error(LlmError::RateLimited)
        .reply_error(LlmError::RateLimited)
        .reply("(return {:ok true})");

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    assert_eq!(step.return_value, Some(kw_map(vec![("ok", Value::Bool(true))])));
    assert_eq!(step.usage.turns, 1);
    assert_eq!(step.usage.llm_requests, 3);
}

#[tokio::test]
async fn budget_exhaustion_reasons() {
    // With retry turns configured, exhaustion is budget_exhausted.
    let agent = Agent::builder()
        .signature("{value :int}")
        .unwrap()
        .max_turns(1)
        .retry_turns(1)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("(return {:value \"a\"})")
        .reply("(return {:value \"b\"})");
    let step = run(agent, RunOptions::new().with_llm(llm)).await;
    assert_eq!(step.fail.as_ref().unwrap().reason, "budget_exhausted");
    assert_eq!(step.turns.as_ref().unwrap().len(), 2);

    // Without retry turns it is max_turns_exceeded, and no retry-typed turn
    // may appear.
    let agent = Agent::builder()
        .signature("{value :int}")
        .unwrap()
        .max_turns(1)
        .retry_turns(0)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new().reply("(return {:value \"a\"})");
    let step = run(agent, RunOptions::new().with_llm(llm)).await;
    assert_eq!(step.fail.as_ref().unwrap().reason, "max_turns_exceeded");
    assert!(step
        .turns
        .as_ref()
        .unwrap()
        .iter()
        .all(|t| t.turn_type != TurnType::Retry));
}

#[tokio::test]
async fn explicit_fail_bypasses_retry() {
    let agent = Agent::builder()
        .signature("{value :int}")
        .unwrap()
        .max_turns(2)
        .retry_turns(3)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("(fail {:reason :no_data :message \"nothing to count\"})");

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    let fail = step.fail.as_ref().unwrap();
    assert_eq!(fail.reason, "no_data");
    assert_eq!(fail.message, "nothing to count");
    assert_eq!(step.usage.turns, 1);
}

#[tokio::test]
async fn firewalled_context_never_reaches_the_llm() {
    let agent = Agent::builder()
        .signature("{result :int}")
        .unwrap()
        .max_turns(2)
        .build()
        .unwrap();
    let llm = Arc::new(
        ScriptedLlm::new()
            .reply("(def doubled (* 2 data/n))")
            .reply("(return {:result doubled})"),
    );

    let step = run(
        Agent::clone(&agent),
        RunOptions::new()
            .with_llm(subagent::llm::LlmBinding::shared(llm.clone()))
            .with_value("n", Value::Int(21))
            .with_value("_secret", Value::Str("swordfish".into())),
    )
    .await;

    assert_eq!(step.return_value, Some(kw_map(vec![("result", Value::Int(42))])));
    for request in llm.requests() {
        assert!(!request.system.contains("swordfish"));
        for message in &request.messages {
            assert!(!message.content.contains("swordfish"));
            assert!(
                !message.content.contains("- data/_secret: string"),
                "firewalled key must not leak its type/sample"
            );
        }
    }
}

#[tokio::test]
async fn cross_agent_turn_budget() {
    let agent = Agent::builder()
        .signature("{value :int}")
        .unwrap()
        .max_turns(5)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new().reply("(def x 1)").reply("(return {:value x})");

    let step = run(
        agent,
        RunOptions::new().with_llm(llm).with_turn_budget(1),
    )
    .await;

    assert_eq!(step.fail.as_ref().unwrap().reason, "turn_budget_exhausted");
    assert_eq!(step.usage.turns, 1);
}

#[tokio::test]
async fn nested_agent_tool_invocation() {
    let child = Agent::builder()
        .prompt("Double {{n}}")
        .signature("(n :int) -> :int")
        .unwrap()
        .max_turns(1)
        .build()
        .unwrap();
    let parent = Agent::builder()
        .signature("{result :int}")
        .unwrap()
        .max_turns(2)
        .tool_entry("double", ToolEntry::agent(child))
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("(def d (tool/double :n 21))")
        .reply("(return (* 2 data/n))") // consumed by the child run
        .reply("(return {:result d})");

    let step = run(parent, RunOptions::new().with_llm(llm)).await;

    assert_eq!(step.return_value, Some(kw_map(vec![("result", Value::Int(42))])));
    let turns = step.turns.as_ref().unwrap();
    assert_eq!(turns[0].tool_calls.len(), 1);
    assert!(turns[0].tool_calls[0].error.is_none());
}

#[tokio::test]
async fn self_recursion_inherits_only_visible_closures() {
    let agent = Agent::builder()
        .max_turns(3)
        .max_depth(2)
        .tool_entry("recurse", ToolEntry::self_ref())
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("(do (def helper (fn [x] (* x 2))) (def _hidden (fn [x] 0)))")
        .reply("(def child_result (tool/recurse {:n 21}))")
        // Child run: the inherited closure works, the underscored one is
        // absent, plain data is not inherited.
        .reply("(return [(helper data/n) (or nil memory/_hidden :absent)])")
        .reply("(return memory/child_result)");

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    assert!(step.fail.is_none(), "fail: {:?}", step.fail);
    assert_eq!(
        step.return_value,
        Some(Value::Vector(vec![
            Value::Int(42),
            Value::Keyword("absent".into())
        ]))
    );
}

#[tokio::test]
async fn max_depth_stops_runaway_recursion() {
    let agent = Agent::builder()
        .max_turns(2)
        .max_depth(0)
        .tool_entry("recurse", ToolEntry::self_ref())
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("(tool/recurse {})")
        .reply("(return :stopped)");

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    assert_eq!(step.return_value, Some(Value::Keyword("stopped".into())));
    let turns = step.turns.as_ref().unwrap();
    let record = &turns[0].tool_calls[0];
    assert!(record.error.as_deref().unwrap().contains("depth"));
}

#[tokio::test]
async fn cached_tools_and_call_records() {
    let agent = Agent::builder()
        .signature("{a :int, b :int}")
        .unwrap()
        .max_turns(2)
        .tool_entry(
            "lookup",
            ToolEntry::func(FnTool::new("lookup", |_args| async { Ok(json!(7)) })).cached(),
        )
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("(do (def a (tool/lookup :k \"x\")) (def b (tool/lookup :k \"x\")))")
        .reply("(return {:a a :b b})");

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    assert_eq!(
        step.return_value,
        Some(kw_map(vec![("a", Value::Int(7)), ("b", Value::Int(7))]))
    );
    let records = &step.turns.as_ref().unwrap()[0].tool_calls;
    assert_eq!(records.len(), 2);
    assert!(!records[0].cached);
    assert!(records[1].cached);
    assert_eq!(records[1].duration_ms, 0);
}

#[tokio::test]
async fn grep_tools_knob_registers_tools() {
    let agent = Agent::builder()
        .signature("[:string]")
        .unwrap()
        .max_turns(1)
        .grep_tools(true)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("(return (tool/grep :pattern \"err\" :text \"ok\\nerror\\nfine\"))");

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    assert_eq!(
        step.return_value,
        Some(Value::Vector(vec![Value::Str("error".into())]))
    );
}

#[tokio::test]
async fn named_llm_resolution_through_registry() {
    use subagent::llm::{LlmBinding, LlmRegistry};

    let agent = Agent::builder()
        .signature(":int")
        .unwrap()
        .max_turns(1)
        .llm(LlmBinding::named("fast"))
        .build()
        .unwrap();

    // Missing registry fails before any turn.
    let step = run(Agent::clone(&agent), RunOptions::new()).await;
    assert_eq!(step.fail.as_ref().unwrap().reason, "llm_registry_required");

    // Unknown name fails with llm_not_found.
    let registry = Arc::new(LlmRegistry::new().register("other", ScriptedLlm::new()));
    let step = run(Agent::clone(&agent), RunOptions::new().with_registry(registry)).await;
    assert_eq!(step.fail.as_ref().unwrap().reason, "llm_not_found");

    // A matching entry resolves and runs.
    let registry = Arc::new(
        LlmRegistry::new().register("fast", ScriptedLlm::new().reply("(return 3)")),
    );
    let step = run(agent, RunOptions::new().with_registry(registry)).await;
    assert_eq!(step.return_value, Some(Value::Int(3)));
}

#[tokio::test]
async fn step_invariants_hold() {
    let agent = Agent::builder()
        .signature("{result :int}")
        .unwrap()
        .max_turns(2)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new()
        .reply("(def x 2)")
        .reply("(return {:result x})");

    let step = run(agent, RunOptions::new().with_llm(llm)).await;

    // Exactly one of return/fail.
    assert!(step.return_value.is_some() ^ step.fail.is_some());
    // Turn count matches usage.
    assert_eq!(step.usage.turns as usize, step.turns.as_ref().unwrap().len());
    // Memory is accumulative across turn snapshots.
    let turns = step.turns.as_ref().unwrap();
    for window in turns.windows(2) {
        for key in window[0].memory.keys() {
            assert!(window[1].memory.contains_key(key));
        }
    }
}

#[tokio::test]
async fn chained_steps_pipe_returns_and_failures() {
    use subagent::executor::then;

    let first = Agent::builder()
        .signature("{n :int}")
        .unwrap()
        .max_turns(1)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new().reply("(return {:n 5})");
    let step = run(first, RunOptions::new().with_llm(llm)).await;

    let second = Agent::builder()
        .prompt("Double {{n}}")
        .signature("(n :int) -> :int")
        .unwrap()
        .max_turns(1)
        .build()
        .unwrap();
    let llm2 = ScriptedLlm::new().reply("(return (* 2 data/n))");
    let step2 = then(step, second, RunOptions::new().with_llm(llm2)).await;
    assert_eq!(step2.return_value, Some(Value::Int(10)));

    // An upstream failure short-circuits with chained_failure.
    let failing = Agent::builder()
        .signature(":int")
        .unwrap()
        .max_turns(1)
        .build()
        .unwrap();
    let llm3 = ScriptedLlm::new().reply("(fail \"broken\")");
    let failed = run(failing, RunOptions::new().with_llm(llm3)).await;

    let next = Agent::builder()
        .signature(":int")
        .unwrap()
        .max_turns(1)
        .build()
        .unwrap();
    let chained = then(failed, next, RunOptions::new()).await;
    let fail = chained.fail.as_ref().unwrap();
    assert_eq!(fail.reason, "chained_failure");
    assert!(fail.message.contains("broken"));
    assert!(fail.details.is_some());
}

#[tokio::test]
async fn trace_mode_controls_turn_retention() {
    use subagent::executor::TraceMode;

    let agent = Agent::builder()
        .signature(":int")
        .unwrap()
        .max_turns(1)
        .build()
        .unwrap();

    let llm = ScriptedLlm::new().reply("(return 1)");
    let step = run(
        Agent::clone(&agent),
        RunOptions::new().with_llm(llm).with_trace_mode(TraceMode::Off),
    )
    .await;
    assert!(step.turns.is_none());

    // on_error keeps turns only for failures.
    let llm = ScriptedLlm::new().reply("(return 1)");
    let step = run(
        Agent::clone(&agent),
        RunOptions::new()
            .with_llm(llm)
            .with_trace_mode(TraceMode::OnError),
    )
    .await;
    assert!(step.turns.is_none());

    let llm = ScriptedLlm::new().reply("(fail \"x\")");
    let step = run(
        agent,
        RunOptions::new()
            .with_llm(llm)
            .with_trace_mode(TraceMode::OnError),
    )
    .await;
    assert!(step.turns.is_some());
}

#[tokio::test]
async fn collect_messages_captures_the_exchange() {
    let agent = Agent::builder()
        .signature(":int")
        .unwrap()
        .max_turns(1)
        .build()
        .unwrap();
    let llm = ScriptedLlm::new().reply("(return 4)");

    let step = run(
        agent,
        RunOptions::new().with_llm(llm).collect_messages(),
    )
    .await;

    let messages = step.messages.as_ref().unwrap();
    assert!(messages.len() >= 3);
    assert_eq!(messages[0].role, subagent::schemas::Role::System);
    assert!(messages.last().unwrap().content.contains("(return 4)"));
}

#[tokio::test]
async fn parse_errors_feed_back_and_recover() {
    let agent = Agent::builder()
        .signature(":int")
        .unwrap()
        .max_turns(2)
        .build()
        .unwrap();
    let llm = Arc::new(
        ScriptedLlm::new()
            .reply("(+ 1")
            .reply("(return 2)"),
    );

    let step = run(
        Agent::clone(&agent),
        RunOptions::new().with_llm(subagent::llm::LlmBinding::shared(llm.clone())),
    )
    .await;

    assert_eq!(step.return_value, Some(Value::Int(2)));
    let turns = step.turns.as_ref().unwrap();
    assert!(!turns[0].success);
    assert!(turns[0].error.as_deref().unwrap().contains("parse_error"));
    // The second request carries the parse feedback.
    let second = &llm.requests()[1];
    let text: String = second
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(text.contains("parse_error"));
}
