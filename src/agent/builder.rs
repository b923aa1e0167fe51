use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::composer::Customize;
use crate::llm::{LlmBinding, RetryPolicy};
use crate::render::Compression;
use crate::signature::{parse_signature, Signature};
use crate::template::Template;
use crate::tools::{CatalogEntry, Tool, ToolEntry, Toolset};

use super::{Agent, AgentError, Limits, OutputMode};

/// Fluent construction of an [`Agent`]. `build` validates the configuration:
/// signature syntax, template syntax, and placeholder/signature consistency.
pub struct AgentBuilder {
    prompt: String,
    signature: Option<Signature>,
    tools: Toolset,
    output_mode: OutputMode,
    limits: Limits,
    llm: Option<LlmBinding>,
    llm_retry: RetryPolicy,
    compression: Option<Arc<dyn Compression>>,
    customize: Customize,
    max_chars: Option<usize>,
    field_descriptions: HashMap<String, String>,
    journaling: bool,
    grep_tools: bool,
    llm_query: bool,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder").finish_non_exhaustive()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            prompt: String::new(),
            signature: None,
            tools: Toolset::new(),
            output_mode: OutputMode::default(),
            limits: Limits::default(),
            llm: None,
            llm_retry: RetryPolicy::default(),
            compression: None,
            customize: Customize::default(),
            max_chars: None,
            field_descriptions: HashMap::new(),
            journaling: false,
            grep_tools: false,
            llm_query: false,
        }
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Parses a signature source string, e.g. `"(n :int) -> {result :int}"`.
    pub fn signature(mut self, source: &str) -> Result<Self, AgentError> {
        self.signature = Some(parse_signature(source)?);
        Ok(self)
    }

    pub fn tool(mut self, name: impl Into<String>, tool: impl Tool + 'static) -> Self {
        self.tools.register(name, ToolEntry::func(tool));
        self
    }

    pub fn tool_entry(mut self, name: impl Into<String>, entry: ToolEntry) -> Self {
        self.tools.register(name, entry);
        self
    }

    pub fn catalog_tool(mut self, name: impl Into<String>, entry: CatalogEntry) -> Self {
        self.tools.register_catalog(name, entry);
        self
    }

    pub fn tools(mut self, tools: Toolset) -> Self {
        self.tools = tools;
        self
    }

    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.limits.max_turns = max_turns;
        self
    }

    pub fn retry_turns(mut self, retry_turns: u32) -> Self {
        self.limits.retry_turns = retry_turns;
        self
    }

    pub fn max_depth(mut self, max_depth: u32) -> Self {
        self.limits.max_depth = max_depth;
        self
    }

    pub fn max_tool_calls(mut self, max_tool_calls: usize) -> Self {
        self.limits.max_tool_calls = max_tool_calls;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout = timeout;
        self
    }

    pub fn pmap_timeout(mut self, pmap_timeout: Duration) -> Self {
        self.limits.pmap_timeout = pmap_timeout;
        self
    }

    pub fn loop_limit(mut self, loop_limit: usize) -> Self {
        self.limits.loop_limit = loop_limit;
        self
    }

    pub fn llm(mut self, llm: impl Into<LlmBinding>) -> Self {
        self.llm = Some(llm.into());
        self
    }

    pub fn llm_retry(mut self, policy: RetryPolicy) -> Self {
        self.llm_retry = policy;
        self
    }

    pub fn compression(mut self, strategy: impl Compression + 'static) -> Self {
        self.compression = Some(Arc::new(strategy));
        self
    }

    pub fn customize(mut self, customize: Customize) -> Self {
        self.customize = customize;
        self
    }

    pub fn max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = Some(max_chars);
        self
    }

    pub fn field_description(
        mut self,
        field: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.field_descriptions.insert(field.into(), description.into());
        self
    }

    pub fn journaling(mut self, enabled: bool) -> Self {
        self.journaling = enabled;
        self
    }

    pub fn grep_tools(mut self, enabled: bool) -> Self {
        self.grep_tools = enabled;
        self
    }

    pub fn llm_query(mut self, enabled: bool) -> Self {
        self.llm_query = enabled;
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        if let Some(signature) = &self.signature {
            for placeholder in placeholders(&self.prompt) {
                if signature.param(&placeholder).is_none() {
                    return Err(AgentError::PlaceholderMissing(placeholder));
                }
            }
        }
        if self.output_mode == OutputMode::Text {
            let template = Template::parse(&self.prompt)?;
            if let Some(signature) = &self.signature {
                template.validate(signature)?;
            }
        }
        Ok(Agent {
            prompt: self.prompt,
            signature: self.signature,
            tools: self.tools,
            output_mode: self.output_mode,
            limits: self.limits,
            llm: self.llm,
            llm_retry: self.llm_retry,
            compression: self.compression,
            customize: self.customize,
            max_chars: self.max_chars,
            field_descriptions: self.field_descriptions,
            journaling: self.journaling,
            grep_tools: self.grep_tools,
            llm_query: self.llm_query,
        })
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn placeholders(prompt: &str) -> Vec<String> {
    let re = Regex::new(r"\{\{(\w+)\}\}").expect("static regex");
    re.captures_iter(prompt)
        .map(|cap| cap[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_must_appear_in_signature() {
        let err = Agent::builder()
            .prompt("Double {{n}} and {{m}}")
            .signature("(n :int) -> :int")
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(err.reason(), "placeholder_missing");
        assert!(err.to_string().contains("{{m}}"));
    }

    #[test]
    fn builds_with_consistent_placeholders() {
        let agent = Agent::builder()
            .prompt("Double {{n}}")
            .signature("(n :int) -> {result :int}")
            .unwrap()
            .max_turns(2)
            .build()
            .unwrap();
        assert!(agent.multi_turn());
        assert_eq!(agent.limits.max_turns, 2);
    }

    #[test]
    fn prompt_without_signature_is_unchecked() {
        assert!(Agent::builder().prompt("Hello {{whoever}}").build().is_ok());
    }

    #[test]
    fn invalid_signature_is_rejected() {
        let err = Agent::builder().signature(":bogus").unwrap_err();
        assert_eq!(err.reason(), "invalid_signature");
    }

    #[test]
    fn text_mode_validates_template_against_signature() {
        let err = Agent::builder()
            .prompt("{{#items}}{{bad}}{{/items}}")
            .signature("(items [{label :string}]) -> :string")
            .unwrap()
            .output_mode(OutputMode::Text)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("bad"));
    }
}
