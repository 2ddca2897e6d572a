//! Capability provider abstraction for switchyard.
//!
//! A standalone library with no dependency on other switchyard crates.
//!
//! - [`Provider`] defines the chat completion interface
//! - [`OpenAiCompatProvider`] implements it for any OpenAI-compatible API
//! - [`LlmProviderConfig`] describes how to reach one endpoint
//!
//! ```rust,ignore
//! use switchyard_llm::{ChatMessage, ChatRequest, LlmProviderConfig, OpenAiCompatProvider, Provider};
//!
//! let provider = OpenAiCompatProvider::new(LlmProviderConfig::new(
//!     "groq",
//!     "https://api.groq.com/openai/v1",
//!     "GROQ_API_KEY",
//! ));
//! let request = ChatRequest::new("llama-3.3-70b-versatile", vec![ChatMessage::user("Hoi")]);
//! let response = provider.complete(&request).await?;
//! println!("{}", response.text().unwrap_or_default());
//! ```

pub mod config;
pub mod error;
pub mod openai_compat;
pub mod provider;
pub mod types;

pub use config::LlmProviderConfig;
pub use error::{ProviderError, Result};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::Provider;
pub use types::{ChatMessage, ChatRequest, ChatResponse, Choice, Usage};
