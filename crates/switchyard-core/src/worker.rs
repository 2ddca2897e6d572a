//! Worker trait, built-in workers and the registry.
//!
//! A [`Worker`] turns request text into one [`Payload`]. The dispatcher
//! looks workers up by id in the [`WorkerRegistry`], together with the
//! [`WorkerSettings`] (timeout, priority, resource class) that govern how
//! each invocation is wrapped.
//!
//! Built-in workers:
//!
//! - [`LlmWorker`]: one system prompt against the capability provider,
//!   through the response cache.
//! - [`EchoWorker`]: canned conversational replies, no provider call.
//! - [`CodeArtifactWorker`]: decorator that lifts fenced code blocks out of
//!   another worker's text into a structured payload.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use regex::Regex;
use switchyard_llm::{ChatMessage, ChatRequest, Provider, ProviderError};
use switchyard_types::config::WorkerConfig;
use switchyard_types::error::looks_like_rate_limit;
use switchyard_types::{Payload, PayloadKind};
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::limiter::credential_index;

/// Error type for worker invocations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// No worker is registered under this id.
    #[error("worker not found: {0}")]
    NotFound(String),

    /// The provider throttled the call.
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The capability provider failed for another reason.
    #[error("provider error: {0}")]
    Provider(String),

    /// The worker itself failed.
    #[error("invocation failed: {0}")]
    Failed(String),
}

impl WorkerError {
    /// Whether this failure belongs to the rate limiter rather than the
    /// circuit breaker.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::NotFound(_) => false,
            Self::Provider(msg) | Self::Failed(msg) => looks_like_rate_limit(msg),
        }
    }
}

impl From<ProviderError> for WorkerError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited { retry_after_ms } => Self::RateLimited { retry_after_ms },
            other => Self::Provider(other.to_string()),
        }
    }
}

/// A specialized unit that answers requests.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Unique id used by the router and the registry.
    fn id(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Produce one payload for `text`.
    async fn invoke(&self, text: &str) -> Result<Payload, WorkerError>;
}

// ── Settings and registry ────────────────────────────────────────────────

/// How the dispatcher wraps invocations of one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub timeout: Duration,
    /// Cooldown priority, 0 is most important.
    pub priority: u8,
    /// Limiter resource class.
    pub resource_class: String,
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig, default_timeout: Duration) -> Self {
        Self {
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
            priority: config.priority,
            resource_class: config.resource_class.clone(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            priority: 2,
            resource_class: "default".into(),
        }
    }
}

struct Registered {
    worker: Arc<dyn Worker>,
    settings: WorkerSettings,
}

/// Workers keyed by id.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Registered>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, replacing any previous one with the same id.
    pub fn register(&mut self, worker: Arc<dyn Worker>, settings: WorkerSettings) {
        let id = worker.id().to_string();
        debug!(worker = %id, timeout_ms = settings.timeout.as_millis() as u64, "registering worker");
        self.workers.insert(id, Registered { worker, settings });
    }

    /// Build the registry for a worker roster.
    ///
    /// `credentials` holds one provider per configured API key; each LLM
    /// worker is pinned to the credential its priority maps to.
    pub fn from_config(
        workers: &[WorkerConfig],
        credentials: &[Arc<dyn Provider>],
        default_model: &str,
        cache: Option<Arc<ResponseCache>>,
        default_timeout: Duration,
    ) -> Self {
        let mut registry = Self::new();
        for config in workers {
            let settings = WorkerSettings::from_config(config, default_timeout);
            let worker: Arc<dyn Worker> = match config.kind.as_str() {
                "echo" => Arc::new(EchoWorker::new(&config.id)),
                "llm" => {
                    let idx = credential_index(config.priority, credentials.len());
                    let Some(provider) = credentials.get(idx) else {
                        warn!(worker = %config.id, "no provider credential, worker not registered");
                        continue;
                    };
                    let llm = LlmWorker::new(config, Arc::clone(provider), default_model, cache.clone());
                    if config.artifacts {
                        Arc::new(CodeArtifactWorker::new(Arc::new(llm)))
                    } else {
                        Arc::new(llm)
                    }
                }
                "custom" => {
                    warn!(worker = %config.id, "custom worker has no implementation supplied, skipping");
                    continue;
                }
                other => {
                    warn!(worker = %config.id, kind = %other, "unknown worker kind, skipping");
                    continue;
                }
            };
            registry.register(worker, settings);
        }
        registry
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(id).map(|r| Arc::clone(&r.worker))
    }

    /// Settings for `id`, or defaults for unknown workers.
    pub fn settings(&self, id: &str) -> WorkerSettings {
        self.workers
            .get(id)
            .map(|r| r.settings.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workers.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

// ── LlmWorker ────────────────────────────────────────────────────────────

/// Worker that answers through the capability provider.
pub struct LlmWorker {
    id: String,
    description: String,
    provider: Arc<dyn Provider>,
    model: String,
    system_prompt: String,
    temperature: f64,
    cache: Option<Arc<ResponseCache>>,
}

impl LlmWorker {
    pub fn new(
        config: &WorkerConfig,
        provider: Arc<dyn Provider>,
        default_model: &str,
        cache: Option<Arc<ResponseCache>>,
    ) -> Self {
        let system_prompt = config.system_prompt.clone().unwrap_or_else(|| {
            format!(
                "You are {}, a specialist worker. {} Answer concisely.",
                config.id, config.description
            )
        });
        Self {
            id: config.id.clone(),
            description: config.description.clone(),
            provider,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            system_prompt,
            temperature: config.temperature,
            cache,
        }
    }
}

#[async_trait]
impl Worker for LlmWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, text: &str) -> Result<Payload, WorkerError> {
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user(text),
        ];

        if let Some(cached) = self
            .cache
            .as_ref()
            .and_then(|c| c.get(&self.model, &messages, self.temperature))
        {
            let mut payload = Payload::text(&self.id, cached);
            payload.meta.cache_hit = true;
            return Ok(payload);
        }

        let request = ChatRequest::new(&self.model, messages).with_temperature(self.temperature);
        let response = self.provider.complete(&request).await?;
        let answer = response
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| WorkerError::Failed("empty completion".into()))?
            .to_string();

        if let Some(cache) = &self.cache {
            cache.put(&self.model, &request.messages, self.temperature, &answer);
        }

        let tokens = response
            .total_tokens()
            .unwrap_or_else(|| request.estimated_tokens() + answer.len() as u64 / 4);
        let mut payload = Payload::text(&self.id, answer);
        payload.meta.tokens = tokens;
        Ok(payload)
    }
}

// ── EchoWorker ───────────────────────────────────────────────────────────

const ECHO_RESPONSES: &[&str] = &[
    "Hi! All systems operational. How can I help?",
    "Hello! The hub is online and listening.",
    "Good day! Standing by.",
    "Hey! Ready when you are.",
];

/// Conversational worker with canned replies.
pub struct EchoWorker {
    id: String,
}

impl EchoWorker {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// One canned reply, chosen at random.
    pub fn canned_reply() -> &'static str {
        ECHO_RESPONSES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("Hello!")
    }
}

#[async_trait]
impl Worker for EchoWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "canned conversational replies"
    }

    async fn invoke(&self, _text: &str) -> Result<Payload, WorkerError> {
        Ok(Payload::text(&self.id, Self::canned_reply()))
    }
}

// ── CodeArtifactWorker ───────────────────────────────────────────────────

static FENCED_CODE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\n(.*?)```")
        .map_err(|e| warn!(error = %e, "invalid code fence pattern"))
        .ok()
});

/// Decorator that turns fenced code in the inner worker's answer into a
/// structured payload: `{"text": ..., "artifacts": [{"language", "code"}]}`.
/// Answers without code pass through untouched.
pub struct CodeArtifactWorker {
    inner: Arc<dyn Worker>,
}

impl CodeArtifactWorker {
    pub fn new(inner: Arc<dyn Worker>) -> Self {
        Self { inner }
    }
}

/// Fenced code blocks in `text` as `(language, code)`.
pub fn extract_code_blocks(text: &str) -> Vec<(String, String)> {
    let Some(re) = FENCED_CODE.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .map(|c| (c[1].to_string(), c[2].trim().to_string()))
        .filter(|(_, code)| !code.is_empty())
        .collect()
}

#[async_trait]
impl Worker for CodeArtifactWorker {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    async fn invoke(&self, text: &str) -> Result<Payload, WorkerError> {
        let payload = self.inner.invoke(text).await?;
        if payload.kind() != PayloadKind::Text {
            return Ok(payload);
        }
        let blocks = extract_code_blocks(payload.display());
        if blocks.is_empty() {
            return Ok(payload);
        }
        let artifacts: Vec<serde_json::Value> = blocks
            .into_iter()
            .map(|(language, code)| serde_json::json!({ "language": language, "code": code }))
            .collect();
        debug!(worker = %self.id(), artifacts = artifacts.len(), "extracted code artifacts");
        let content = serde_json::json!({
            "text": payload.display(),
            "artifacts": artifacts,
        });
        let mut structured = Payload::structured(payload.worker(), content, payload.display());
        structured.meta = payload.meta;
        Ok(structured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use switchyard_llm::{ChatResponse, Choice, Usage};
    use switchyard_types::config::CacheConfig;

    struct Stub {
        reply: Mutex<Result<String, ProviderError>>,
        calls: Mutex<u32>,
    }

    impl Stub {
        fn ok(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Ok(text.into())),
                calls: Mutex::new(0),
            })
        }

        fn err(err: ProviderError) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Err(err)),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, _request: &ChatRequest) -> switchyard_llm::Result<ChatResponse> {
            *self.calls.lock() += 1;
            let text = match &*self.reply.lock() {
                Ok(t) => t.clone(),
                Err(ProviderError::RateLimited { retry_after_ms }) => {
                    return Err(ProviderError::RateLimited {
                        retry_after_ms: *retry_after_ms,
                    });
                }
                Err(e) => {
                    return Err(ProviderError::Status {
                        status: 500,
                        message: e.to_string(),
                    });
                }
            };
            Ok(ChatResponse {
                id: "1".into(),
                choices: vec![Choice {
                    index: 0,
                    message: ChatMessage::assistant(text),
                    finish_reason: None,
                }],
                usage: Some(Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                }),
                model: "m".into(),
            })
        }
    }

    fn config(id: &str) -> WorkerConfig {
        let mut c = WorkerConfig::new(id);
        c.description = "Crypto analysis.".into();
        c.temperature = 0.2;
        c
    }

    #[test]
    fn provider_error_classification() {
        let e: WorkerError = ProviderError::RateLimited { retry_after_ms: 10 }.into();
        assert!(e.is_rate_limit());
        let e: WorkerError = ProviderError::Status {
            status: 503,
            message: "too many requests, slow down".into(),
        }
        .into();
        assert!(e.is_rate_limit());
        let e: WorkerError = ProviderError::TimedOut.into();
        assert!(!e.is_rate_limit());
        assert!(!WorkerError::NotFound("x".into()).is_rate_limit());
    }

    #[tokio::test]
    async fn llm_worker_returns_text_with_tokens() {
        let stub = Stub::ok("  BTC is up.  ");
        let worker = LlmWorker::new(&config("cipher"), stub, "m", None);
        let payload = worker.invoke("btc?").await.unwrap();
        assert_eq!(payload.display(), "BTC is up.");
        assert_eq!(payload.meta.tokens, 15);
        assert!(!payload.meta.cache_hit);
    }

    #[tokio::test]
    async fn llm_worker_uses_cache() {
        let stub = Stub::ok("cached answer");
        let cache = Arc::new(ResponseCache::new(CacheConfig::default()));
        let worker = LlmWorker::new(&config("cipher"), stub.clone(), "m", Some(cache));
        worker.invoke("q").await.unwrap();
        let second = worker.invoke("q").await.unwrap();
        assert!(second.meta.cache_hit);
        assert_eq!(second.display(), "cached answer");
        assert_eq!(*stub.calls.lock(), 1);
    }

    #[tokio::test]
    async fn llm_worker_empty_completion_fails() {
        let worker = LlmWorker::new(&config("cipher"), Stub::ok("   "), "m", None);
        assert!(matches!(worker.invoke("q").await, Err(WorkerError::Failed(_))));
    }

    #[tokio::test]
    async fn llm_worker_maps_rate_limit() {
        let stub = Stub::err(ProviderError::RateLimited { retry_after_ms: 500 });
        let worker = LlmWorker::new(&config("cipher"), stub, "m", None);
        let err = worker.invoke("q").await.unwrap_err();
        assert!(matches!(err, WorkerError::RateLimited { retry_after_ms: 500 }));
    }

    #[tokio::test]
    async fn echo_worker_replies_from_canned_set() {
        let worker = EchoWorker::new("echo");
        let payload = worker.invoke("hallo").await.unwrap();
        assert!(ECHO_RESPONSES.contains(&payload.display()));
        assert_eq!(payload.worker(), "echo");
    }

    #[test]
    fn extracts_fenced_blocks() {
        let text = "Here:\n```rust\nfn main() {}\n```\nand\n```\nls -la\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(
            blocks,
            vec![
                ("rust".to_string(), "fn main() {}".to_string()),
                (String::new(), "ls -la".to_string()),
            ]
        );
        assert!(extract_code_blocks("no code").is_empty());
    }

    #[tokio::test]
    async fn artifact_decorator_structures_code() {
        let inner = Arc::new(LlmWorker::new(
            &config("iolaax"),
            Stub::ok("Try:\n```python\nprint(1)\n```"),
            "m",
            None,
        ));
        let worker = CodeArtifactWorker::new(inner);
        assert_eq!(worker.id(), "iolaax");
        let payload = worker.invoke("print one").await.unwrap();
        assert_eq!(payload.kind(), PayloadKind::Structured);
        assert_eq!(payload.content()["artifacts"][0]["language"], "python");
        assert_eq!(payload.content()["artifacts"][0]["code"], "print(1)");
        assert_eq!(payload.meta.tokens, 15);
    }

    #[tokio::test]
    async fn artifact_decorator_passes_plain_text() {
        let inner = Arc::new(EchoWorker::new("echo"));
        let payload = CodeArtifactWorker::new(inner).invoke("hi").await.unwrap();
        assert_eq!(payload.kind(), PayloadKind::Text);
    }

    #[test]
    fn registry_from_config() {
        let mut llm = config("cipher");
        llm.timeout_secs = Some(5);
        let mut code = config("iolaax");
        code.artifacts = true;
        let mut echo = WorkerConfig::new("echo");
        echo.kind = "echo".into();
        let mut odd = WorkerConfig::new("odd");
        odd.kind = "telepathy".into();

        let creds: Vec<Arc<dyn Provider>> = vec![Stub::ok("x")];
        let registry = WorkerRegistry::from_config(
            &[llm, code, echo, odd],
            &creds,
            "m",
            None,
            Duration::from_secs(20),
        );
        assert_eq!(registry.list(), vec!["cipher", "echo", "iolaax"]);
        assert_eq!(registry.settings("cipher").timeout, Duration::from_secs(5));
        assert_eq!(registry.settings("echo").timeout, Duration::from_secs(20));
        assert_eq!(registry.settings("missing"), WorkerSettings::default());
    }

    #[test]
    fn registry_without_credentials_skips_llm_workers() {
        let registry = WorkerRegistry::from_config(
            &[config("cipher")],
            &[],
            "m",
            None,
            Duration::from_secs(20),
        );
        assert!(registry.is_empty());
    }
}
