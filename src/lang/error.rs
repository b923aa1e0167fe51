use thiserror::Error;

/// Failure while reading source text into a raw syntax tree.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("parse error at {line}:{col}: {hint}")]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub hint: String,
}

impl ParseError {
    pub fn new(line: usize, col: usize, hint: impl Into<String>) -> Self {
        Self {
            line,
            col,
            hint: hint.into(),
        }
    }
}

/// Failure while lowering the raw syntax tree to the core form.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("analyze error in {path}: {reason}")]
pub struct AnalyzeError {
    /// Source form the error was found in, e.g. `(let ...)`.
    pub path: String,
    pub reason: String,
}

impl AnalyzeError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Runtime failure during evaluation. Each variant maps onto one reason of
/// the run-level failure taxonomy via [`EvalError::reason`].
#[derive(Error, Debug, Clone)]
pub enum EvalError {
    #[error("type error: {0}")]
    Type(String),

    #[error("arity mismatch: {0}")]
    Arity(String),

    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("unbound symbol: {0}")]
    Unbound(String),

    #[error("not callable: {0}")]
    NotCallable(String),

    #[error("destructuring failed: {0}")]
    Destructure(String),

    #[error("cannot shadow builtin: {0}")]
    ShadowBuiltin(String),

    #[error("loop limit exceeded: {0}")]
    LoopLimit(String),

    #[error("invalid tool arguments: {0}")]
    InvalidToolArgs(String),

    #[error("pmap failed: {0}")]
    Pmap(String),

    #[error("pcalls failed: {0}")]
    Pcalls(String),

    /// Dispatcher failure, already classified by the tools layer.
    #[error("{message}")]
    Tool {
        reason: &'static str,
        message: String,
    },
}

impl EvalError {
    pub fn reason(&self) -> &'static str {
        match self {
            EvalError::Type(_) => "type_error",
            EvalError::Arity(_) => "arity_mismatch",
            EvalError::Arithmetic(_) => "arithmetic_error",
            EvalError::Unbound(_) => "unbound_var",
            EvalError::NotCallable(_) => "not_callable",
            EvalError::Destructure(_) => "destructure_error",
            EvalError::ShadowBuiltin(_) => "cannot_shadow_builtin",
            EvalError::LoopLimit(_) => "loop_limit_exceeded",
            EvalError::InvalidToolArgs(_) => "invalid_tool_args",
            EvalError::Pmap(_) => "pmap_error",
            EvalError::Pcalls(_) => "pcalls_error",
            EvalError::Tool { reason, .. } => reason,
        }
    }
}
