use std::collections::HashMap;

use crate::lang::Value;
use crate::schemas::{Message, Turn};

/// Everything a strategy may draw on when rendering the prompt for the next
/// turn. Borrowed, immutable; strategies are pure functions over it.
pub struct RenderInput<'a> {
    /// Mission with placeholders already expanded (firewalled values
    /// redacted).
    pub mission: &'a str,
    pub turns: &'a [Turn],
    pub memory: &'a HashMap<String, Value>,
    /// Corrective feedback for this turn (validation errors, tool failures,
    /// parse errors).
    pub feedback: Option<&'a str>,
    /// Work turns remaining, including the one being rendered.
    pub turns_left: u32,
    pub must_return: bool,
    pub retry: bool,
}

#[derive(Debug, Clone)]
pub struct RenderOpts {
    /// Most recent tool calls to summarize.
    pub max_tool_summaries: usize,
    /// Most recent print lines to include.
    pub max_prints: usize,
}

impl Default for RenderOpts {
    fn default() -> Self {
        Self {
            max_tool_summaries: 10,
            max_prints: 10,
        }
    }
}

/// A message-history compression strategy. Must be pure: identical input
/// produces identical messages.
pub trait Compression: Send + Sync {
    fn to_messages(&self, input: &RenderInput, opts: &RenderOpts) -> Vec<Message>;
}

/// `_`-prefixed names are evaluator-visible but never rendered for the LLM.
pub fn firewalled(name: &str) -> bool {
    name.starts_with('_')
}

pub const FIREWALLED_LABEL: &str = "[Firewalled] [Hidden]";

/// One definition-table line: name, type label, optional short sample.
pub fn definition_line(name: &str, value: &Value, with_sample: bool) -> String {
    if firewalled(name) {
        return format!("- {name}: {FIREWALLED_LABEL}");
    }
    if with_sample {
        format!("- {name}: {} = {}", value.type_label(), value.summarize())
    } else {
        format!("- {name}: {}", value.type_label())
    }
}
