//! Boundary traits for the services the hub consults but does not own.
//!
//! - [`MemoryStore`]: long-term knowledge used for context enrichment and
//!   the event log. [`NoopMemory`] is the default.
//! - [`SafetyRules`]: the rule engine behind the admission gate.
//!   [`PatternSafetyRules`] is a local reference implementation.
//! - [`RelevanceBias`]: optional learned per-worker multipliers.
//! - [`Planner`]: proposes revised tasks and verifies results for the
//!   repair loop. [`LlmPlanner`] asks the capability provider.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use switchyard_llm::{ChatMessage, ChatRequest, Provider, ProviderError};
use switchyard_types::Payload;
use thiserror::Error;
use tracing::{debug, warn};

use crate::limiter::RateLimiter;

/// Errors raised by collaborator implementations.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator could not be reached.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator answered with something unusable.
    #[error("invalid collaborator response: {0}")]
    Invalid(String),

    /// The capability provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

// ── Tasks and repair plans ───────────────────────────────────────────────

/// One unit of work for the task pipeline and the repair loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Text handed to the pipeline.
    pub input: String,
    /// What a correct result should contain; `None` skips verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expectation: Option<String>,
}

impl Task {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expectation: None,
        }
    }

    pub fn with_expectation(mut self, expectation: impl Into<String>) -> Self {
        self.expectation = Some(expectation.into());
        self
    }

    /// The expectation, ignoring blank strings.
    pub fn expectation(&self) -> Option<&str> {
        self.expectation
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }
}

/// A planner's proposal for rerunning a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairPlan {
    /// Replacement input for the rerun.
    pub revised_input: String,
    /// Planner's reading of what went wrong.
    #[serde(default)]
    pub analysis: String,
    /// Short label of the chosen strategy.
    #[serde(default)]
    pub strategy: String,
}

/// Planner verdict on whether payloads satisfy a task's expectation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub matched: bool,
    pub analysis: String,
}

impl Verification {
    /// The verdict used when there is nothing to check.
    pub fn trivially_matched() -> Self {
        Self {
            matched: true,
            analysis: String::new(),
        }
    }

    /// The verdict used when the check itself could not be completed.
    pub fn unknown() -> Self {
        Self {
            matched: false,
            analysis: "unknown".into(),
        }
    }
}

// ── MemoryStore ──────────────────────────────────────────────────────────

/// A remembered fact with the store's confidence in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub text: String,
    pub confidence: f32,
}

/// Long-term knowledge store.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Up to `limit` context fragments relevant to `query`.
    async fn fetch_context(&self, query: &str, limit: usize)
    -> Result<Vec<String>, CollaboratorError>;

    /// Append an entry to the event log.
    async fn log_event(
        &self,
        actor: &str,
        action: &str,
        details: &serde_json::Value,
    ) -> Result<(), CollaboratorError>;

    /// Facts held with at least `min_confidence`.
    async fn recall_facts(&self, min_confidence: f32) -> Result<Vec<Fact>, CollaboratorError>;
}

/// Fire-and-forget [`MemoryStore::log_event`]. Failures are logged and
/// otherwise ignored.
pub fn spawn_log_event(
    store: Arc<dyn MemoryStore>,
    actor: impl Into<String>,
    action: impl Into<String>,
    details: serde_json::Value,
) {
    let actor = actor.into();
    let action = action.into();
    tokio::spawn(async move {
        if let Err(e) = store.log_event(&actor, &action, &details).await {
            warn!(actor = %actor, action = %action, error = %e, "event log write failed");
        }
    });
}

/// Memory store that remembers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMemory;

#[async_trait]
impl MemoryStore for NoopMemory {
    async fn fetch_context(
        &self,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<String>, CollaboratorError> {
        Ok(Vec::new())
    }

    async fn log_event(
        &self,
        _actor: &str,
        _action: &str,
        _details: &serde_json::Value,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn recall_facts(&self, _min_confidence: f32) -> Result<Vec<Fact>, CollaboratorError> {
        Ok(Vec::new())
    }
}

// ── SafetyRules ──────────────────────────────────────────────────────────

/// Safety and compliance rule engine consulted before admission.
#[async_trait]
pub trait SafetyRules: Send + Sync {
    /// `(true, _)` admits the text; `(false, reason)` blocks it.
    async fn validate(&self, text: &str) -> Result<(bool, String), CollaboratorError>;
}

const INJECTION_PATTERNS: &[&str] = &[
    r"ignore\s+(all\s+)?previous\s+instructions",
    r"vergeet\s+(alles|alle\s+instructies)",
    r"negeer\s+(alles|alle\s+instructies)",
    r"jailbreak",
    r"dan\s+mode",
    r"developer\s+mode",
    r"act\s+as\s+if\s+you\s+have\s+no",
    r"pretend\s+(you|that)\s+(are|have)\s+no",
    r"bypass\s+(safety|filter|restriction)",
    r"disregard\s+(your|all|safety)",
    r"system\s*prompt",
    r"repeat\s+the\s+(text|words)\s+above",
    r"output\s+(your|the)\s+(system|initial)",
];

/// Length limit plus a fixed set of prompt-injection patterns.
pub struct PatternSafetyRules {
    max_chars: usize,
    patterns: Vec<Regex>,
}

impl PatternSafetyRules {
    pub fn new(max_chars: usize) -> Self {
        let patterns = INJECTION_PATTERNS
            .iter()
            .filter_map(|p| match Regex::new(&format!("(?i){p}")) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "skipping invalid injection pattern");
                    None
                }
            })
            .collect();
        Self {
            max_chars,
            patterns,
        }
    }
}

#[async_trait]
impl SafetyRules for PatternSafetyRules {
    async fn validate(&self, text: &str) -> Result<(bool, String), CollaboratorError> {
        let chars = text.chars().count();
        if chars > self.max_chars {
            return Ok((
                false,
                format!("input too long ({chars} > {} characters)", self.max_chars),
            ));
        }
        if let Some(re) = self.patterns.iter().find(|re| re.is_match(text)) {
            debug!(pattern = %re.as_str(), "injection pattern matched");
            return Ok((false, "possible prompt injection".into()));
        }
        Ok((true, String::new()))
    }
}

// ── RelevanceBias ────────────────────────────────────────────────────────

/// Learned routing preferences, applied as multipliers on similarity.
#[async_trait]
pub trait RelevanceBias: Send + Sync {
    /// Multiplier per worker id; workers not in the map keep 1.0.
    async fn bias_for(&self, text: &str) -> HashMap<String, f32>;
}

// ── Planner ──────────────────────────────────────────────────────────────

/// Planning collaborator used by the repair loop.
#[async_trait]
pub trait Planner: Send + Sync {
    /// A revised task after `error`, or `None` when no plan can be made.
    async fn revise(&self, error: &str, task: &Task) -> Option<RepairPlan>;

    /// Whether `payloads` satisfy the task's expectation.
    async fn verify(&self, task: &Task, payloads: &[Payload]) -> Verification;
}

/// Characters of each payload shown to the planner during verification.
const VERIFY_EXCERPT_CHARS: usize = 300;

/// [`Planner`] that asks the capability provider for JSON answers.
pub struct LlmPlanner {
    provider: Arc<dyn Provider>,
    model: String,
    limiter: Option<Arc<RateLimiter>>,
}

/// Limiter caller id for planner calls.
pub const PLANNER_CALLER: &str = "planner";

#[derive(Deserialize)]
struct VerifyReply {
    #[serde(rename = "match")]
    matched: bool,
    #[serde(default, alias = "analysis")]
    analyse: String,
}

#[derive(Deserialize)]
struct ReviseReply {
    #[serde(alias = "revisedInput")]
    revised_input: String,
    #[serde(default)]
    analysis: String,
    #[serde(default)]
    strategy: String,
}

impl LlmPlanner {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            limiter: None,
        }
    }

    /// Budget every planner call against `limiter` as [`PLANNER_CALLER`]
    /// at priority 0.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    async fn ask(&self, prompt: String) -> Result<String, CollaboratorError> {
        if let Some(limiter) = &self.limiter {
            limiter
                .acquire(PLANNER_CALLER, "primary")
                .await
                .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;
        }
        let request = ChatRequest::new(&self.model, vec![ChatMessage::user(prompt)])
            .with_temperature(0.0);
        let response = match self.provider.complete(&request).await {
            Ok(response) => response,
            Err(e) => {
                if let (Some(limiter), true) = (&self.limiter, e.is_rate_limited()) {
                    limiter.record_failure(PLANNER_CALLER, 0);
                }
                return Err(e.into());
            }
        };
        if let (Some(limiter), Some(tokens)) = (&self.limiter, response.total_tokens()) {
            limiter.record_tokens(PLANNER_CALLER, tokens);
        }
        response
            .text()
            .map(str::to_string)
            .ok_or_else(|| CollaboratorError::Invalid("empty completion".into()))
    }
}

/// Extract the first JSON object from a completion, tolerating code fences
/// and surrounding prose.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn revise(&self, error: &str, task: &Task) -> Option<RepairPlan> {
        let prompt = format!(
            "A task failed and must be retried once.\n\n\
             TASK: {}\nEXPECTATION: {}\nERROR: {error}\n\n\
             Reply ONLY with JSON:\n\
             {{\"revised_input\": \"...\", \"analysis\": \"...\", \"strategy\": \"...\"}}",
            task.input,
            task.expectation().unwrap_or("-"),
        );
        let text = match self.ask(prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "planner revise call failed");
                return None;
            }
        };
        let reply: ReviseReply = extract_json_object(&text)
            .and_then(|json| serde_json::from_str(json).ok())?;
        if reply.revised_input.trim().is_empty() {
            return None;
        }
        Some(RepairPlan {
            revised_input: reply.revised_input,
            analysis: reply.analysis,
            strategy: reply.strategy,
        })
    }

    async fn verify(&self, task: &Task, payloads: &[Payload]) -> Verification {
        let Some(expectation) = task.expectation() else {
            return Verification::trivially_matched();
        };
        let summary = payloads
            .iter()
            .map(|p| {
                let excerpt: String = p.display().chars().take(VERIFY_EXCERPT_CHARS).collect();
                format!("{}: {excerpt}", p.worker())
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Judge whether the output meets the expectation.\n\n\
             TASK: {}\nEXPECTATION: {expectation}\nOUTPUT:\n{summary}\n\n\
             Reply ONLY with JSON:\n{{\"match\": true/false, \"analyse\": \"explanation\"}}",
            task.input,
        );
        match self.ask(prompt).await {
            Ok(text) => extract_json_object(&text)
                .and_then(|json| serde_json::from_str::<VerifyReply>(json).ok())
                .map(|r| Verification {
                    matched: r.matched,
                    analysis: r.analyse,
                })
                .unwrap_or_else(Verification::unknown),
            Err(e) => {
                warn!(error = %e, "planner verify call failed");
                Verification::unknown()
            }
        }
    }
}
