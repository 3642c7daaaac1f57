//! Adapter for OpenAI-compatible chat completion APIs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AdapterCounters, ModelApiError, ModelAdapter, ModelCallOutcome, RateLimiter};
use crate::domain::TokenCount;
use crate::time_provider::SharedTimeProvider;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: ChatUsage,
}

/// Adapter for OpenAI and OpenAI-API-compatible hosted models.
pub struct OpenAiAdapter {
    name: String,
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
    counters: AdapterCounters,
    rate_limiter: RateLimiter,
}

impl OpenAiAdapter {
    /// Builds a new OpenAI-compatible adapter.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        client: reqwest::Client,
        min_interval: std::time::Duration,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
            client,
            counters: AdapterCounters::default(),
            rate_limiter: RateLimiter::new(min_interval, time),
        }
    }
}

#[async_trait]
impl ModelAdapter for OpenAiAdapter {
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
            max_tokens: max_output_tokens,
            temperature,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelApiError::retryable(format!("openai call timed out: {e}"))
                } else {
                    ModelApiError::retryable(format!("openai request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelApiError::retryable(format!("openai returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelApiError::permanent(format!(
                "openai returned {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelApiError::permanent(format!("unexpected response shape: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ModelApiError::permanent("openai response had no choices"))?;

        let input_tokens = TokenCount::new(parsed.usage.prompt_tokens);
        let output_tokens = TokenCount::new(parsed.usage.completion_tokens);
        self.counters.record(input_tokens, output_tokens);

        Ok(ModelCallOutcome {
            content,
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
