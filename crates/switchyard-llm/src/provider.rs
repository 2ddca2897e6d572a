//! The [`Provider`] trait for chat completions.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ChatRequest, ChatResponse};

/// A capability provider that can execute chat completion requests.
///
/// The hub only depends on this trait. The bundled implementation is
/// [`OpenAiCompatProvider`](crate::openai_compat::OpenAiCompatProvider);
/// tests substitute scripted providers.
///
/// Throttling must be reported as
/// [`ProviderError::RateLimited`](crate::error::ProviderError::RateLimited)
/// so the limiter and the repair loop can tell it apart from other failures.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider name (e.g. "groq", "openai").
    fn name(&self) -> &str;

    /// Execute a chat completion request and return the response.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;
}
