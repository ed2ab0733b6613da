//! OpenAI-compatible inference client.
//!
//! Sends non-streaming chat completion requests to a local LLM endpoint,
//! optionally constrained by a JSON schema, and returns the message text.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::errors::InferenceError;
use super::types::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ResponseFormat};
use crate::config::ModelConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before the single retry of a retriable failure.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Name attached to the schema in `response_format`.
const SCHEMA_NAME: &str = "decision";

// ─── ChatModel ───────────────────────────────────────────────────────────────

/// The underlying model, as seen by the decision engine.
///
/// `schema`, when given, constrains the output to a JSON document matching it.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        schema: Option<&serde_json::Value>,
    ) -> Result<String, InferenceError>;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// HTTP client for the local LLM inference endpoint.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelConfig,
    api_key: Option<String>,
}

impl InferenceClient {
    /// Create a client. Does NOT check connectivity; see [`Self::health_check`].
    pub fn new(config: ModelConfig) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| InferenceError::ConfigError {
                reason: format!("environment variable '{var}' is not set"),
            })?),
            None => None,
        };

        Ok(Self {
            http,
            config,
            api_key,
        })
    }

    /// The base URL of the model endpoint.
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// The configured model name.
    pub fn model_name(&self) -> &str {
        &self.config.model_name
    }

    /// Check if the model endpoint is reachable. Does not consume tokens.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.config.base_url);
        let mut request = self.http.get(&url).timeout(CONNECT_TIMEOUT);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Send one chat completion request.
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        schema: Option<&serde_json::Value>,
    ) -> Result<String, InferenceError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = ChatCompletionRequest {
            model: self.config.model_name.clone(),
            messages: messages.to_vec(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
            response_format: schema.map(|s| ResponseFormat::json_schema(SCHEMA_NAME, s.clone())),
        };

        tracing::debug!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            constrained = body.response_format.is_some(),
            max_tokens = body.max_tokens,
            "sending chat completion"
        );

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.config.request_timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::EmptyResponse {
                reason: format!("failed to read response body: {e}"),
            })?;
        parse_completion_text(&body_text)
    }
}

#[async_trait]
impl ChatModel for InferenceClient {
    /// One retry on retriable failures; anything else surfaces immediately.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        schema: Option<&serde_json::Value>,
    ) -> Result<String, InferenceError> {
        match self.chat_completion(messages, schema).await {
            Err(e) if e.is_retriable() => {
                tracing::warn!(error = %e, "model request failed, retrying once");
                tokio::time::sleep(RETRY_DELAY).await;
                self.chat_completion(messages, schema).await
            }
            other => other,
        }
    }
}

/// Extract `choices[0].message.content` from a completion body.
pub fn parse_completion_text(body: &str) -> Result<String, InferenceError> {
    let resp: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::EmptyResponse {
            reason: format!("failed to parse completion response: {e}"),
        })?;

    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| InferenceError::EmptyResponse {
            reason: "response had no message content".to_string(),
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
