use std::sync::Arc;

use async_trait::async_trait;

use super::{ChatRequest, ChatResponse, LlmError, LlmRegistry};

/// The single entry point the runtime uses to talk to a model. Transports
/// (HTTP, streaming, tokenization) live behind implementations of this
/// trait.
#[async_trait]
pub trait Llm: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}

#[async_trait]
impl<F, Fut> Llm for F
where
    F: Fn(ChatRequest) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<ChatResponse, LlmError>> + Send,
{
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        self(request).await
    }
}

/// An agent's LLM binding: a callable, or a symbolic key resolved through
/// the process-wide registry at run time.
#[derive(Clone)]
pub enum LlmBinding {
    Shared(Arc<dyn Llm>),
    Named(String),
}

impl LlmBinding {
    pub fn named(name: impl Into<String>) -> Self {
        LlmBinding::Named(name.into())
    }

    pub fn shared(llm: Arc<dyn Llm>) -> Self {
        LlmBinding::Shared(llm)
    }

    pub fn resolve(&self, registry: Option<&LlmRegistry>) -> Result<Arc<dyn Llm>, LlmError> {
        match self {
            LlmBinding::Shared(llm) => Ok(llm.clone()),
            LlmBinding::Named(name) => registry
                .ok_or(LlmError::RegistryRequired)?
                .get(name)
                .ok_or_else(|| LlmError::NotFound(name.clone())),
        }
    }
}

impl std::fmt::Debug for LlmBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmBinding::Shared(_) => write!(f, "LlmBinding::Shared(..)"),
            LlmBinding::Named(name) => write!(f, "LlmBinding::Named({name})"),
        }
    }
}

impl<L: Llm + 'static> From<L> for LlmBinding {
    fn from(llm: L) -> Self {
        LlmBinding::Shared(Arc::new(llm))
    }
}
