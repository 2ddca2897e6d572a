//! Provider endpoint configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How to reach one OpenAI-compatible endpoint with one credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    /// Human-readable provider name (e.g. "groq").
    pub name: String,

    /// Base URL for the API (e.g. "https://api.groq.com/openai/v1").
    pub base_url: String,

    /// Environment variable that holds the API key.
    pub api_key_env: String,

    /// Extra HTTP headers to include in every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request timeout in seconds. Defaults to 120.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl LlmProviderConfig {
    /// A config with no extra headers and the default timeout.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key_env: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key_env: api_key_env.into(),
            headers: HashMap::new(),
            timeout_secs: None,
        }
    }

    /// Effective timeout in seconds.
    pub fn timeout(&self) -> u64 {
        self.timeout_secs.unwrap_or(120)
    }
}
