use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM rate limited (429)")]
    RateLimited,

    #[error("LLM server error: {0}")]
    Server(String),

    #[error("LLM client error ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("no LLM named '{0}' in the registry")]
    NotFound(String),

    #[error("an llm_registry is required to resolve a named LLM")]
    RegistryRequired,

    #[error("LLM failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl LlmError {
    /// Transport policy: retry on timeout, rate limit (429), 5xx, and
    /// connection-level failures. Never on other 4xx or registry lookups.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout | LlmError::RateLimited | LlmError::Server(_) | LlmError::Transport(_)
        )
    }

    /// Reason used when the failure surfaces in a `Step.fail`.
    pub fn reason(&self) -> &'static str {
        match self {
            LlmError::NotFound(_) => "llm_not_found",
            LlmError::RegistryRequired => "llm_registry_required",
            _ => "llm_error",
        }
    }
}
