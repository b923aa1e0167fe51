use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::lang::{builtins, Value};
use crate::llm::{ChatRequest, Llm};
use crate::schemas::Message;
use crate::signature::parse_signature;

use super::{Tool, ToolEntry, ToolError, Toolset};

/// Registers `grep` / `grep-n` as callable tools (the `grep_tools` knob).
pub fn register_grep_tools(toolset: &mut Toolset) {
    toolset.register("grep", ToolEntry::func(GrepTool { numbered: false }));
    toolset.register("grep-n", ToolEntry::func(GrepTool { numbered: true }));
}

/// Registers the ad-hoc LLM tool (the `llm_query` knob), bound to the run's
/// LLM.
pub fn register_llm_query(toolset: &mut Toolset, llm: Arc<dyn Llm>) {
    toolset.register("llm_query", ToolEntry::func(LlmQueryTool { llm }));
}

struct GrepTool {
    numbered: bool,
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> String {
        if self.numbered { "grep-n" } else { "grep" }.into()
    }

    fn description(&self) -> String {
        if self.numbered {
            "Filters lines matching a regex pattern, prefixing 1-based line numbers.".into()
        } else {
            "Filters lines matching a regex pattern.".into()
        }
    }

    fn signature(&self) -> Option<crate::signature::Signature> {
        parse_signature("(pattern :string, text :string) -> [:string]").ok()
    }

    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError> {
        let pattern = required_str(&args, "pattern")?;
        let text = args.get("text").cloned().unwrap_or(JsonValue::Null);
        let result = builtins::call_pure(
            if self.numbered { "grep-n" } else { "grep" },
            vec![Value::Str(pattern), Value::from_json(&text)],
        )
        .map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(result.to_json())
    }
}

struct LlmQueryTool {
    llm: Arc<dyn Llm>,
}

#[async_trait]
impl Tool for LlmQueryTool {
    fn name(&self) -> String {
        "llm_query".into()
    }

    fn description(&self) -> String {
        "Asks the language model a one-shot question; returns its text reply.".into()
    }

    fn signature(&self) -> Option<crate::signature::Signature> {
        parse_signature("(prompt :string, context :string?) -> :string").ok()
    }

    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError> {
        let prompt = required_str(&args, "prompt")?;
        let content = match args.get("context").and_then(JsonValue::as_str) {
            Some(context) => format!("{prompt}\n\nContext:\n{context}"),
            None => prompt,
        };
        let request = ChatRequest::new(
            "Answer directly and concisely.",
            vec![Message::user(content)],
            1,
        );
        let response = self
            .llm
            .chat(request)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(JsonValue::String(response.content))
    }
}

fn required_str(args: &JsonValue, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolError::Execution(format!("missing required argument '{key}'")))
}
