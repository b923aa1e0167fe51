use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use super::{ChatRequest, ChatResponse, Llm, LlmError};

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Constant,
    Linear,
    Exponential,
}

/// Retry policy for LLM transport failures. Retries never count as turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay: Duration,
    /// Random fraction (0.0–1.0) added to each delay to avoid thundering
    /// herds.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(500),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let ms = match self.backoff {
            Backoff::Constant => base,
            Backoff::Linear => base.saturating_mul(attempt as u64),
            Backoff::Exponential => base.saturating_mul(1u64 << (attempt - 1).min(16)),
        };
        let jitter = if self.jitter_factor > 0.0 {
            let cap = (ms as f64 * self.jitter_factor).max(1.0) as u64;
            rand::thread_rng().gen_range(0..=cap)
        } else {
            0
        };
        Duration::from_millis(ms + jitter)
    }
}

/// Calls the LLM with the given policy. Returns the response and the number
/// of requests actually issued, so the caller can account them separately
/// from turns.
pub async fn chat_with_retry(
    llm: &dyn Llm,
    request: ChatRequest,
    policy: &RetryPolicy,
) -> (Result<ChatResponse, LlmError>, u32) {
    let max_attempts = policy.max_attempts.max(1);
    let mut requests = 0;
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        requests += 1;
        match llm.chat(request.clone()).await {
            Ok(response) => return (Ok(response), requests),
            Err(e) if e.retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "LLM attempt {attempt}/{max_attempts} failed ({e}), retrying in {:?}",
                    delay
                );
                last_error = Some(e);
                sleep(delay).await;
            }
            Err(e) if e.retryable() => {
                return (
                    Err(LlmError::Exhausted {
                        attempts: requests,
                        last: e.to_string(),
                    }),
                    requests,
                );
            }
            Err(e) => return (Err(e), requests),
        }
    }

    let last = last_error.map(|e| e.to_string()).unwrap_or_default();
    (
        Err(LlmError::Exhausted {
            attempts: requests,
            last,
        }),
        requests,
    )
}
