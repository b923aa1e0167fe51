use crate::schemas::Message;

use super::{Compression, RenderInput, RenderOpts};

/// Alternative strategy: the last N turns replayed as alternating
/// assistant/user messages, preceded by one mission message. Costs more
/// tokens than [`super::Coalesced`] but preserves verbatim programs.
#[derive(Debug)]
pub struct Windowed {
    pub window: usize,
}

impl Default for Windowed {
    fn default() -> Self {
        Self { window: 4 }
    }
}

impl Compression for Windowed {
    fn to_messages(&self, input: &RenderInput, _opts: &RenderOpts) -> Vec<Message> {
        let mut messages = vec![Message::user(input.mission.to_string())];
        let start = input.turns.len().saturating_sub(self.window);
        for turn in &input.turns[start..] {
            messages.push(Message::assistant(format!(
                "```clojure\n{}\n```",
                turn.program
            )));
            let outcome = match (&turn.result, &turn.error) {
                (_, Some(error)) => format!("Error: {error}"),
                (Some(result), None) => format!("Result: {}", result.summarize()),
                (None, None) => "Result: nil".to_string(),
            };
            let prints = if turn.prints.is_empty() {
                String::new()
            } else {
                format!("\nOutput:\n{}", turn.prints.join("\n"))
            };
            messages.push(Message::user(format!("{outcome}{prints}")));
        }

        let mut status = String::new();
        if let Some(feedback) = input.feedback {
            status.push_str(feedback);
            status.push('\n');
        }
        if input.must_return {
            status.push_str(
                "FINAL TURN: you MUST respond with (return <value>) or (fail <reason>).",
            );
        } else if input.retry {
            status.push_str("Respond with a corrected (return <value>).");
        } else {
            status.push_str(&format!("Turns left: {}", input.turns_left));
        }
        messages.push(Message::user(status));
        messages
    }
}
