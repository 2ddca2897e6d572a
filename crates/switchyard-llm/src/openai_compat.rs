//! OpenAI-compatible provider implementation.
//!
//! [`OpenAiCompatProvider`] works with any API that follows the OpenAI chat
//! completion format (Groq, OpenAI, OpenRouter, local gateways).

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::LlmProviderConfig;
use crate::error::{ProviderError, Result};
use crate::provider::Provider;
use crate::types::{ChatRequest, ChatResponse};

/// A provider that POSTs to `{base_url}/chat/completions`.
///
/// One instance holds one credential. The hub builds one instance per
/// configured key and lets the limiter pick among them.
pub struct OpenAiCompatProvider {
    config: LlmProviderConfig,
    http: reqwest::Client,
    api_key: Option<String>,
}

impl OpenAiCompatProvider {
    /// Create a provider whose key is read from `config.api_key_env` at
    /// request time.
    pub fn new(config: LlmProviderConfig) -> Self {
        let http = build_client(&config);
        Self {
            config,
            http,
            api_key: None,
        }
    }

    /// Create a provider with an explicit API key.
    pub fn with_api_key(config: LlmProviderConfig, api_key: String) -> Self {
        let http = build_client(&config);
        Self {
            config,
            http,
            api_key: Some(api_key),
        }
    }

    /// Returns the provider configuration.
    pub fn config(&self) -> &LlmProviderConfig {
        &self.config
    }

    fn completions_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        format!("{base}/chat/completions")
    }

    /// Resolve the API key: explicit key > environment variable.
    fn resolve_api_key(&self) -> Result<String> {
        if let Some(ref key) = self.api_key {
            return Ok(key.clone());
        }
        std::env::var(&self.config.api_key_env).map_err(|_| ProviderError::MissingCredential {
            env: self.config.api_key_env.clone(),
        })
    }
}

fn build_client(config: &LlmProviderConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout()))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let api_key = self.resolve_api_key()?;
        let url = self.completions_url();

        debug!(
            provider = %self.config.name,
            model = %request.model,
            messages = request.messages.len(),
            "sending chat completion request"
        );

        let mut req = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json");

        for (k, v) in &self.config.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = req.json(request).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::TimedOut
            } else {
                ProviderError::Unreachable(e)
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let header_ms = parse_retry_after_header(&response);
            let body = response.text().await.unwrap_or_default();
            let err = status_error(status.as_u16(), &body, header_ms, &request.model);
            if err.is_rate_limited() {
                warn!(provider = %self.config.name, error = %err, "throttled by provider");
            }
            return Err(err);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        debug!(
            provider = %self.config.name,
            model = %chat_response.model,
            choices = chat_response.choices.len(),
            "chat completion response received"
        );

        Ok(chat_response)
    }
}

/// Map a non-success answer to the error the hub acts on.
fn status_error(status: u16, body: &str, header_ms: Option<u64>, model: &str) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            retry_after_ms: header_ms.or_else(|| parse_retry_after_ms(body)).unwrap_or(1000),
        },
        401 | 403 => ProviderError::Unauthorized(body.to_string()),
        404 => ProviderError::Status {
            status,
            message: format!("model '{model}' not found: {body}"),
        },
        _ => ProviderError::Status {
            status,
            message: extract_error_message(body).unwrap_or_else(|| body.to_string()),
        },
    }
}

/// Extract a human-readable error message from a JSON error body.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("error").and_then(|v| {
        v.get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
            .or_else(|| v.as_str().map(String::from))
    })
}

/// Retry hint from the `Retry-After` header, numeric seconds only.
fn parse_retry_after_header(response: &reqwest::Response) -> Option<u64> {
    let header_val = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())?;
    let secs = header_val.trim().parse::<f64>().ok()?;
    Some((secs * 1000.0).max(0.0) as u64)
}

/// Retry hint from a JSON error body (`retry_after_ms` or `retry_after`).
fn parse_retry_after_ms(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("retry_after_ms")
        .and_then(|v| v.as_u64())
        .or_else(|| {
            value
                .get("retry_after")
                .and_then(|v| v.as_f64())
                .map(|secs| (secs * 1000.0) as u64)
        })
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.config.name)
            .field("base_url", &self.config.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}
