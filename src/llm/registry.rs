use std::collections::HashMap;
use std::sync::Arc;

use super::Llm;

/// Process-wide map of named LLMs. Read-only once built; shared across
/// nested agent runs. Lookups are validated at call time, not at
/// configuration time.
#[derive(Clone, Default)]
pub struct LlmRegistry {
    llms: HashMap<String, Arc<dyn Llm>>,
}

impl LlmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, llm: impl Llm + 'static) -> Self {
        self.llms.insert(name.into(), Arc::new(llm));
        self
    }

    pub fn register_shared(mut self, name: impl Into<String>, llm: Arc<dyn Llm>) -> Self {
        self.llms.insert(name.into(), llm);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Llm>> {
        self.llms.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.llms.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for LlmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmRegistry")
            .field("names", &self.names())
            .finish()
    }
}
