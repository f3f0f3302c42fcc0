use std::time::Duration;

use reqwest::Client;

use super::error::AnthropicError;
use super::types::{Message, MessagesRequest, MessagesResponse};

pub const API_URL: &str = "https://api.anthropic.com/v1/messages";

pub struct AnthropicClient {
    api_key: String,
    model: String,
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String) -> Result<Self, AnthropicError> {
        Self::with_base_url(api_key, model, API_URL.to_string(), Duration::from_secs(120))
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(
        api_key: String,
        model: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, AnthropicError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            api_key,
            model,
            client,
            base_url,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await
            .map_err(AnthropicError::from_transport)?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(AnthropicError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AnthropicError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .json::<MessagesResponse>()
            .await
            .map_err(AnthropicError::from_transport)?;
        Ok(body)
    }

    /// Single-turn completion returning the concatenated text blocks.
    pub async fn complete(
        &self,
        system: &str,
        prompt: String,
        max_tokens: u32,
    ) -> Result<String, AnthropicError> {
        let req = MessagesRequest {
            model: self.model.clone(),
            max_tokens,
            system: Some(system.to_string()),
            messages: vec![Message::user(prompt)],
        };
        let text = self.send_message(&req).await?.text();
        if text.trim().is_empty() {
            return Err(AnthropicError::EmptyContent);
        }
        Ok(text)
    }
}
