use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::Agent;
use crate::signature::Signature;

use super::Tool;

/// How a registered name is executed.
#[derive(Clone)]
pub enum ToolHandler {
    /// A plain host function.
    Func(Arc<dyn Tool>),
    /// A nested agent; its context is the argument map, its result the
    /// child's return value.
    Agent(Arc<Agent>),
    /// Recursion into the enclosing agent, guarded by `max_depth`.
    SelfRef,
}

/// One callable registry entry. Metadata set here overrides whatever the
/// handler reports about itself.
#[derive(Clone)]
pub struct ToolEntry {
    pub handler: ToolHandler,
    pub signature: Option<Signature>,
    pub description: Option<String>,
    /// Cache results per run, keyed by `{name, args}`. Only successes are
    /// stored.
    pub cache: bool,
}

impl ToolEntry {
    pub fn func(tool: impl Tool + 'static) -> Self {
        Self {
            handler: ToolHandler::Func(Arc::new(tool)),
            signature: None,
            description: None,
            cache: false,
        }
    }

    pub fn agent(agent: Agent) -> Self {
        Self {
            handler: ToolHandler::Agent(Arc::new(agent)),
            signature: None,
            description: None,
            cache: false,
        }
    }

    pub fn self_ref() -> Self {
        Self {
            handler: ToolHandler::SelfRef,
            signature: None,
            description: None,
            cache: false,
        }
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn effective_signature(&self) -> Option<Signature> {
        self.signature.clone().or_else(|| match &self.handler {
            ToolHandler::Func(tool) => tool.signature(),
            ToolHandler::Agent(agent) => agent.signature.clone(),
            ToolHandler::SelfRef => None,
        })
    }

    pub fn effective_description(&self) -> String {
        self.description.clone().unwrap_or_else(|| match &self.handler {
            ToolHandler::Func(tool) => tool.description(),
            ToolHandler::Agent(_) => "Delegates to a nested agent.".into(),
            ToolHandler::SelfRef => "Recursively invokes this agent.".into(),
        })
    }
}

/// A catalog-only entry: visible in the prompt for planning, but any
/// invocation is rejected with feedback.
#[derive(Debug, Clone, Default)]
pub struct CatalogEntry {
    pub signature: Option<Signature>,
    pub description: Option<String>,
}

/// The agent's tool registry: callable entries plus the planning catalog.
#[derive(Clone, Default)]
pub struct Toolset {
    entries: HashMap<String, ToolEntry>,
    catalog: HashMap<String, CatalogEntry>,
}

impl Toolset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, entry: ToolEntry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn register_catalog(&mut self, name: impl Into<String>, entry: CatalogEntry) {
        self.catalog.insert(name.into(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.entries.get(name)
    }

    pub fn is_catalog_only(&self, name: &str) -> bool {
        !self.entries.contains_key(name) && self.catalog.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.catalog.is_empty()
    }

    pub fn has_callable(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Callable names, sorted for stable prompts.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn catalog_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.catalog.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn catalog_entry(&self, name: &str) -> Option<&CatalogEntry> {
        self.catalog.get(name)
    }
}
