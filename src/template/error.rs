use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("template syntax error: {0}")]
    Parse(String),

    #[error("missing template variable: {0}")]
    MissingVariable(String),

    #[error("template does not match the signature: {0}")]
    Validation(String),
}
