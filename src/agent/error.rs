use thiserror::Error;

use crate::signature::SignatureError;
use crate::template::TemplateError;

/// Configuration problems caught when building an agent, before any turn
/// runs.
#[derive(Error, Debug)]
pub enum AgentError {
    /// A `{{placeholder}}` in the prompt has no matching signature input.
    #[error("prompt placeholder '{{{{{0}}}}}' is not declared in the signature inputs")]
    PlaceholderMissing(String),

    #[error(transparent)]
    InvalidSignature(#[from] SignatureError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl AgentError {
    pub fn reason(&self) -> &'static str {
        match self {
            AgentError::PlaceholderMissing(_) => "placeholder_missing",
            AgentError::InvalidSignature(_) => "invalid_signature",
            AgentError::Template(_) => "invalid_signature",
        }
    }
}
