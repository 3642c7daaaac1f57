//! Adapter for Anthropic's Messages API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AdapterCounters, ModelApiError, ModelAdapter, ModelCallOutcome, RateLimiter};
use crate::domain::TokenCount;
use crate::time_provider::SharedTimeProvider;

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

/// Adapter for Anthropic-hosted models, reached over HTTPS with an API key
/// header.
pub struct AnthropicAdapter {
    name: String,
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
    counters: AdapterCounters,
    rate_limiter: RateLimiter,
}

impl AnthropicAdapter {
    /// Builds a new Anthropic adapter.
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
impl ModelAdapter for AnthropicAdapter {
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

        let request = AnthropicRequest {
            model: &self.model,
            system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: user,
            }],
            max_tokens: max_output_tokens,
            temperature,
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelApiError::retryable(format!("anthropic call timed out: {e}"))
                } else {
                    ModelApiError::retryable(format!("anthropic request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelApiError::retryable(format!(
                "anthropic returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelApiError::permanent(format!(
                "anthropic returned {status}: {body}"
            )));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ModelApiError::permanent(format!("unexpected response shape: {e}")))?;

        let content = parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        let input_tokens = TokenCount::new(parsed.usage.input_tokens);
        let output_tokens = TokenCount::new(parsed.usage.output_tokens);
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
