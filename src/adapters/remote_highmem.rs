//! Adapter for a remote high-memory node, e.g. a shared DGX box running a
//! large local model behind the same chat-endpoint shape as
//! [`super::local_http::LocalHttpAdapter`].
//!
//! Kept as a distinct type (rather than a type alias) because the tier-3
//! provider pool distinguishes it by tag (`dgx`) and by host, and because a
//! future divergence in wire shape (batching, a different auth header)
//! should not force a rename at every call site.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AdapterCounters, ModelApiError, ModelAdapter, ModelCallOutcome, RateLimiter};
use crate::domain::TokenCount;
use crate::time_provider::SharedTimeProvider;

#[derive(Serialize)]
struct ChatOptions {
    num_ctx: u32,
    num_predict: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    options: ChatOptions,
    format: &'static str,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

/// Adapter for a remote high-memory node reached over plain HTTP, typically
/// hosting a model too large to run on the orchestrator's own machine.
pub struct RemoteHighMemAdapter {
    name: String,
    base_url: String,
    model: String,
    context_length: u32,
    client: reqwest::Client,
    counters: AdapterCounters,
    rate_limiter: RateLimiter,
}

impl RemoteHighMemAdapter {
    /// Builds a new remote high-memory adapter.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        context_length: u32,
        client: reqwest::Client,
        min_interval: std::time::Duration,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            model: model.into(),
            context_length,
            client,
            counters: AdapterCounters::default(),
            rate_limiter: RateLimiter::new(min_interval, time),
        }
    }
}

#[async_trait]
impl ModelAdapter for RemoteHighMemAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        system: &str,
        user: &str,
        max_output_tokens: u32,
        temperature: f32,
    ) -> Result<ModelCallOutcome, ModelApiError> {
        self.rate_limiter.wait_turn().await;

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            options: ChatOptions {
                num_ctx: self.context_length,
                num_predict: max_output_tokens,
                temperature,
            },
            format: "json",
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelApiError::retryable(format!("remote high-mem node timed out: {e}"))
                } else {
                    ModelApiError::retryable(format!("remote high-mem node request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelApiError::retryable(format!(
                "remote high-mem node returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelApiError::permanent(format!(
                "remote high-mem node returned {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelApiError::permanent(format!("unexpected response shape: {e}")))?;

        let input_tokens = TokenCount::new(parsed.prompt_eval_count);
        let output_tokens = TokenCount::new(parsed.eval_count);
        self.counters.record(input_tokens, output_tokens);

        Ok(ModelCallOutcome {
            content: parsed.message.content,
            input_tokens,
            output_tokens,
        })
    }

    fn input_tokens_total(&self) -> u64 {
        self.counters.input_tokens_total()
    }

    fn output_tokens_total(&self) -> u64 {
        self.counters.output_tokens_total()
    }

    fn call_count(&self) -> u64 {
        self.counters.call_count()
    }
}
