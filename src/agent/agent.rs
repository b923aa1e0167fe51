use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::composer::Customize;
use crate::llm::{LlmBinding, RetryPolicy};
use crate::render::Compression;
use crate::signature::Signature;
use crate::tools::Toolset;

use super::AgentBuilder;

/// How the agent exchanges results with the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// The LLM writes programs in the expression language.
    #[default]
    Dsl,
    /// The LLM returns JSON matching the signature's schema; no tools, no
    /// memory.
    Json,
    /// Templated prompt; plain text / JSON reply, or the provider's native
    /// tool-call API when tools are present.
    Text,
}

/// Resource ceilings for one run.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Primary work-turn budget.
    pub max_turns: u32,
    /// Extra turns granted only for fixing invalid return values.
    pub retry_turns: u32,
    /// Recursive self/nested call depth.
    pub max_depth: u32,
    /// Hard cap on tool executions across the run.
    pub max_tool_calls: usize,
    /// Per-tool timeout.
    pub timeout: Duration,
    /// Per parallel batch (`pmap` / `pcalls`).
    pub pmap_timeout: Duration,
    /// `loop`/`recur` iteration bound.
    pub loop_limit: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_turns: 10,
            retry_turns: 2,
            max_depth: 3,
            max_tool_calls: 50,
            timeout: Duration::from_secs(60),
            pmap_timeout: Duration::from_secs(60),
            loop_limit: 10_000,
        }
    }
}

/// Immutable agent configuration: mission, contract, tools, and budgets.
/// Built once, borrowed by the loop for each run.
#[derive(Clone)]
pub struct Agent {
    /// Mission template with `{{var}}` placeholders.
    pub prompt: String,
    pub signature: Option<Signature>,
    pub tools: Toolset,
    pub output_mode: OutputMode,
    pub limits: Limits,
    /// LLM binding; falls back to the run options when unset.
    pub llm: Option<LlmBinding>,
    pub llm_retry: RetryPolicy,
    pub compression: Option<Arc<dyn Compression>>,
    pub customize: Customize,
    /// Prompt-size ceiling for composed blocks.
    pub max_chars: Option<usize>,
    /// Per-field hints injected into JSON-mode schemas.
    pub field_descriptions: HashMap<String, String>,
    /// Enables the task journal docs and `step-done`.
    pub journaling: bool,
    /// Auto-register grep / grep-n as tools.
    pub grep_tools: bool,
    /// Auto-register the ad-hoc LLM tool.
    pub llm_query: bool,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").finish_non_exhaustive()
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub fn multi_turn(&self) -> bool {
        self.limits.max_turns > 1
    }
}
