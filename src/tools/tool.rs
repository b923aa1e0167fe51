use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::signature::Signature;

use super::ToolError;

/// A host-provided capability the DSL can invoke as `(tool/name ...)`.
///
/// Arguments arrive as a JSON object whose keys were stringified at the
/// dispatch boundary. Handlers may be called concurrently from different
/// agent runs and must not assume single-threaded access.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> String;

    fn description(&self) -> String {
        String::new()
    }

    /// Typed contract, used for the tool catalog and native tool-call
    /// schemas.
    fn signature(&self) -> Option<Signature> {
        None
    }

    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError>;
}

type BoxedHandler = Box<
    dyn Fn(JsonValue) -> Pin<Box<dyn Future<Output = Result<JsonValue, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// Adapts a plain async closure into a [`Tool`].
pub struct FnTool {
    name: String,
    description: String,
    signature: Option<Signature>,
    handler: BoxedHandler,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            signature: None,
            handler: Box::new(move |args| Box::pin(handler(args))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn signature(&self) -> Option<Signature> {
        self.signature.clone()
    }

    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError> {
        (self.handler)(args).await
    }
}
