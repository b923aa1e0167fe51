use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::schemas::ToolCallRequest;

use super::{ChatRequest, ChatResponse, Llm, LlmError, TokenUsage};

/// An LLM that replays a fixed script of replies and records every request
/// it receives. The backbone of the test suite; also useful for dry runs.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

pub enum ScriptedReply {
    Text(String),
    WithTokens(String, TokenUsage),
    ToolCalls(Vec<ToolCallRequest>),
    Error(LlmError),
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, content: impl Into<String>) -> Self {
        self.push(ScriptedReply::Text(content.into()))
    }

    pub fn reply_with_tokens(self, content: impl Into<String>, tokens: TokenUsage) -> Self {
        self.push(ScriptedReply::WithTokens(content.into(), tokens))
    }

    pub fn reply_tool_calls(self, calls: Vec<ToolCallRequest>) -> Self {
        self.push(ScriptedReply::ToolCalls(calls))
    }

    pub fn reply_error(self, error: LlmError) -> Self {
        self.push(ScriptedReply::Error(error))
    }

    fn push(self, reply: ScriptedReply) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
        self
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Llm for ScriptedLlm {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match next {
            Some(ScriptedReply::Text(content)) => Ok(ChatResponse::text(content)),
            Some(ScriptedReply::WithTokens(content, tokens)) => Ok(ChatResponse {
                content,
                tokens,
                tool_calls: vec![],
            }),
            Some(ScriptedReply::ToolCalls(tool_calls)) => Ok(ChatResponse {
                content: String::new(),
                tokens: TokenUsage::default(),
                tool_calls,
            }),
            Some(ScriptedReply::Error(error)) => Err(error),
            None => Err(LlmError::Transport("scripted LLM ran out of replies".into())),
        }
    }
}
