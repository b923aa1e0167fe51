use thiserror::Error;

pub const SIGNATURE_HINT: &str = "valid forms: a primitive (:string :int :float :bool :keyword :map :fn :any), an optional primitive (:int?), a list ([:T]), a map ({name :T, other [:T]}), or a full signature ((param :T, ...) -> :T)";

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid signature: {message}; {SIGNATURE_HINT}")]
pub struct SignatureError {
    pub message: String,
}

impl SignatureError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
