use indoc::{formatdoc, indoc};

use crate::lang::Value;
use crate::schemas::Message;

use super::{definition_line, firewalled, Compression, RenderInput, RenderOpts};

/// The default strategy: the whole history collapses into one consolidated
/// USER message, so prompt size stays stable across turns instead of growing
/// linearly.
///
/// Section order: mission, tool-call summary, closure table, definition
/// table, captured prints, failed turns verbatim, turns-left banner.
#[derive(Debug, Default)]
pub struct Coalesced;

impl Compression for Coalesced {
    fn to_messages(&self, input: &RenderInput, opts: &RenderOpts) -> Vec<Message> {
        let mut out = String::new();
        out.push_str(input.mission);
        out.push('\n');

        let tool_calls: Vec<_> = input
            .turns
            .iter()
            .flat_map(|t| t.tool_calls.iter())
            .collect();
        if !tool_calls.is_empty() {
            out.push_str("\n## Tool calls so far\n");
            let skipped = tool_calls.len().saturating_sub(opts.max_tool_summaries);
            if skipped > 0 {
                out.push_str(&format!("({skipped} earlier calls omitted)\n"));
            }
            for call in tool_calls.iter().rev().take(opts.max_tool_summaries).rev() {
                let args = Value::from_json(&call.args).summarize();
                let cached = if call.cached { " (cached)" } else { "" };
                match &call.error {
                    Some(error) => {
                        out.push_str(&format!("- {}({args}) FAILED: {error}\n", call.name))
                    }
                    None => out.push_str(&format!(
                        "- {}({args}) -> {}{cached}\n",
                        call.name, call.result
                    )),
                }
            }
        }

        let mut names: Vec<&String> = input.memory.keys().collect();
        names.sort();
        let (closures, defs): (Vec<&String>, Vec<&String>) = names
            .iter()
            .copied()
            .partition(|n| matches!(input.memory.get(n.as_str()), Some(Value::Closure(_))));
        if !closures.is_empty() {
            out.push_str("\n## Functions in memory\n");
            for name in &closures {
                if firewalled(name.as_str()) {
                    continue;
                }
                let doc = match input.memory.get(name.as_str()) {
                    Some(Value::Closure(closure)) => closure.doc.clone(),
                    _ => None,
                };
                match doc {
                    Some(doc) => out.push_str(&format!("- {name}: {doc}\n")),
                    None => out.push_str(&format!("- {name}\n")),
                }
            }
        }

        // Samples are suppressed when prints exist; the model already saw
        // concrete output this turn.
        let prints: Vec<&String> = input.turns.iter().flat_map(|t| t.prints.iter()).collect();
        if !defs.is_empty() {
            out.push_str("\n## Definitions\n");
            for name in &defs {
                if let Some(value) = input.memory.get(name.as_str()) {
                    out.push_str(&definition_line(name.as_str(), value, prints.is_empty()));
                    out.push('\n');
                }
            }
        }

        if !prints.is_empty() {
            out.push_str("\n## Output\n");
            let skipped = prints.len().saturating_sub(opts.max_prints);
            if skipped > 0 {
                out.push_str(&format!("({skipped} earlier lines omitted)\n"));
            }
            for line in prints.iter().rev().take(opts.max_prints).rev() {
                out.push_str(line);
                out.push('\n');
            }
        }

        let failed: Vec<_> = input.turns.iter().filter(|t| !t.success).collect();
        if !failed.is_empty() {
            out.push_str("\n## Failed attempts\n");
            for turn in failed {
                out.push_str(&formatdoc! {"
                    ### Turn {number}
                    ```clojure
                    {program}
                    ```
                    Error: {error}
                ",
                    number = turn.number,
                    program = turn.program,
                    error = turn.error.as_deref().unwrap_or("unknown"),
                });
            }
        }

        if let Some(feedback) = input.feedback {
            out.push_str("\n## Feedback\n");
            out.push_str(feedback);
            out.push('\n');
        }

        out.push('\n');
        if input.must_return {
            out.push_str(indoc! {"
                FINAL TURN: you MUST respond with (return <value>) or (fail <reason>).
                Tools are no longer available.
            "});
        } else if input.retry {
            out.push_str(indoc! {"
                Your previous return value was invalid.
                Respond with a corrected (return <value>).
            "});
        } else {
            out.push_str(&format!("Turns left: {}\n", input.turns_left));
        }

        vec![Message::user(out.trim_end().to_string())]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::schemas::{ToolCallRecord, Turn, TurnType};

    use super::*;

    fn turn(number: u32, success: bool) -> Turn {
        Turn {
            number,
            turn_type: TurnType::Normal,
            program: format!("(def x {number})"),
            result: Some(Value::Var("x".into())),
            error: (!success).then(|| "unbound symbol: y".to_string()),
            prints: vec![],
            tool_calls: vec![],
            memory: HashMap::new(),
            success,
        }
    }

    fn render(input: &RenderInput) -> String {
        let messages = Coalesced.to_messages(input, &RenderOpts::default());
        assert_eq!(messages.len(), 1);
        messages[0].content.clone()
    }

    #[test]
    fn renders_sections_in_order() {
        let memory = HashMap::from([
            ("total".to_string(), Value::Int(12)),
            ("_secret".to_string(), Value::Str("hidden".into())),
        ]);
        let turns = vec![turn(1, true), turn(2, false)];
        let input = RenderInput {
            mission: "Count the items.",
            turns: &turns,
            memory: &memory,
            feedback: None,
            turns_left: 3,
            must_return: false,
            retry: false,
        };
        let content = render(&input);
        assert!(content.starts_with("Count the items."));
        assert!(content.contains("- total: integer = 12"));
        assert!(content.contains("- _secret: [Firewalled] [Hidden]"));
        assert!(!content.contains("hidden"));
        assert!(content.contains("### Turn 2"));
        assert!(content.contains("unbound symbol: y"));
        assert!(content.ends_with("Turns left: 3"));
    }

    #[test]
    fn must_return_banner_replaces_turn_count() {
        let memory = HashMap::new();
        let input = RenderInput {
            mission: "m",
            turns: &[],
            memory: &memory,
            feedback: None,
            turns_left: 1,
            must_return: true,
            retry: false,
        };
        let content = render(&input);
        assert!(content.contains("FINAL TURN"));
        assert!(!content.contains("Turns left"));
    }

    #[test]
    fn pure_over_identical_input() {
        let memory = HashMap::from([("x".to_string(), Value::Int(1))]);
        let turns = vec![turn(1, true)];
        let input = RenderInput {
            mission: "m",
            turns: &turns,
            memory: &memory,
            feedback: Some("fix it"),
            turns_left: 2,
            must_return: false,
            retry: false,
        };
        assert_eq!(render(&input), render(&input));
    }

    #[test]
    fn tool_summaries_are_capped_most_recent() {
        let mut t = turn(1, true);
        t.tool_calls = (0..15)
            .map(|i| ToolCallRecord {
                name: format!("tool{i}"),
                args: serde_json::json!({}),
                result: "ok".into(),
                duration_ms: 1,
                cached: false,
                error: None,
            })
            .collect();
        let memory = HashMap::new();
        let turns = vec![t];
        let input = RenderInput {
            mission: "m",
            turns: &turns,
            memory: &memory,
            feedback: None,
            turns_left: 2,
            must_return: false,
            retry: false,
        };
        let content = render(&input);
        assert!(content.contains("(5 earlier calls omitted)"));
        assert!(!content.contains("tool4("));
        assert!(content.contains("tool14("));
    }
}
