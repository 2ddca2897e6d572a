//! Configuration schema types.
//!
//! Every struct accepts both `snake_case` and `camelCase` field names and
//! fills missing fields from its `default_*` function, so an empty JSON
//! object yields a fully working configuration. Unknown fields are ignored.
//!
//! # Module Structure
//!
//! - [`loader`] -- config file discovery and key normalization
//! - [`roster`] -- the built-in worker roster used when none is configured

pub mod loader;
pub mod roster;

pub use loader::{load_config, load_config_from};
pub use roster::builtin_workers;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwitchyardError};

fn default_true() -> bool {
    true
}

// ── Root config ──────────────────────────────────────────────────────────

/// Root configuration for the switchyard hub.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Capability provider connection settings.
    #[serde(default)]
    pub provider: ProviderSettings,

    /// Worker declarations. Empty means "use the built-in roster".
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,

    /// Semantic router settings.
    #[serde(default)]
    pub router: RouterConfig,

    /// Worker dispatcher settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Circuit breaker settings.
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Rate limiter settings.
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Response cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Pipeline tuner settings.
    #[serde(default)]
    pub tuner: TunerConfig,

    /// Admission gate settings.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Repair loop settings.
    #[serde(default)]
    pub repair: RepairConfig,
}

impl Config {
    /// The configured workers, or the built-in roster when none are declared.
    pub fn effective_workers(&self) -> Vec<WorkerConfig> {
        if self.workers.is_empty() {
            roster::builtin_workers()
        } else {
            self.workers.clone()
        }
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let r = &self.router;
        if !(r.min_threshold <= r.threshold && r.threshold <= r.max_threshold) {
            return Err(invalid(format!(
                "router.threshold {} outside [{}, {}]",
                r.threshold, r.min_threshold, r.max_threshold
            )));
        }
        if r.max_fanout == 0 {
            return Err(invalid("router.max_fanout must be at least 1"));
        }
        if r.default_worker.trim().is_empty() {
            return Err(invalid("router.default_worker must not be empty"));
        }

        let workers = self.effective_workers();
        let mut seen = HashSet::new();
        for w in &workers {
            if !seen.insert(w.id.as_str()) {
                return Err(invalid(format!("duplicate worker id '{}'", w.id)));
            }
            if !WORKER_KINDS.contains(&w.kind.as_str()) {
                return Err(invalid(format!(
                    "worker '{}' has unknown kind '{}' (expected one of {})",
                    w.id,
                    w.kind,
                    WORKER_KINDS.join(", ")
                )));
            }
            if !self.limiter.classes.contains_key(&w.resource_class) {
                return Err(invalid(format!(
                    "worker '{}' uses unknown resource class '{}'",
                    w.id, w.resource_class
                )));
            }
        }
        if !seen.contains(r.default_worker.as_str()) {
            return Err(invalid(format!(
                "default worker '{}' is not declared",
                r.default_worker
            )));
        }
        for pair in &r.exclusive_pairs {
            for id in pair {
                if !seen.contains(id.as_str()) {
                    return Err(invalid(format!(
                        "exclusive pair names unknown worker '{id}'"
                    )));
                }
            }
        }

        if self.circuit.failure_threshold == 0 {
            return Err(invalid("circuit.failure_threshold must be at least 1"));
        }
        if self.dispatch.max_inflight == 0 {
            return Err(invalid("dispatch.max_inflight must be at least 1"));
        }
        if self.limiter.priority_cooldowns_secs.is_empty() {
            return Err(invalid("limiter.priority_cooldowns_secs must not be empty"));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> SwitchyardError {
    SwitchyardError::ConfigInvalid {
        reason: reason.into(),
    }
}

// ── Provider ─────────────────────────────────────────────────────────────

/// Connection settings for the OpenAI-compatible capability provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider name used in logs.
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Base URL of the chat completions API.
    #[serde(default = "default_base_url", alias = "baseUrl")]
    pub base_url: String,

    /// Environment variables holding API keys, one per credential.
    ///
    /// With several entries the limiter rotates credentials by caller
    /// priority.
    #[serde(default = "default_api_key_envs", alias = "apiKeyEnvs")]
    pub api_key_envs: Vec<String>,

    /// Model used when a worker does not name one.
    #[serde(default = "default_model", alias = "defaultModel")]
    pub default_model: String,

    /// Model used by the planner for repair plans and verification.
    #[serde(default = "default_model", alias = "plannerModel")]
    pub planner_model: String,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_provider_timeout", alias = "timeoutSecs")]
    pub timeout_secs: u64,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_provider_name() -> String {
    "groq".into()
}
fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".into()
}
fn default_api_key_envs() -> Vec<String> {
    vec!["GROQ_API_KEY".into()]
}
fn default_model() -> String {
    "llama-3.3-70b-versatile".into()
}
fn default_provider_timeout() -> u64 {
    60
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: default_base_url(),
            api_key_envs: default_api_key_envs(),
            default_model: default_model(),
            planner_model: default_model(),
            timeout_secs: default_provider_timeout(),
            headers: HashMap::new(),
        }
    }
}

// ── Workers ──────────────────────────────────────────────────────────────

/// Declaration of one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Unique worker id (lowercase by convention).
    pub id: String,

    /// One-line role description, used as the system prompt when
    /// `system_prompt` is absent.
    #[serde(default)]
    pub description: String,

    /// Reference texts embedded at startup into the worker's sense vectors.
    #[serde(default)]
    pub senses: Vec<String>,

    /// Keywords for fallback routing (matched as lowercase substrings).
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Worker implementation, one of [`WORKER_KINDS`].
    #[serde(default = "default_worker_kind")]
    pub kind: String,

    /// Model override.
    #[serde(default)]
    pub model: Option<String>,

    /// System prompt override.
    #[serde(default, alias = "systemPrompt")]
    pub system_prompt: Option<String>,

    /// Sampling temperature; values at or below the cache ceiling are cached.
    #[serde(default = "default_worker_temperature")]
    pub temperature: f64,

    /// Per-worker timeout override in seconds.
    #[serde(default, alias = "timeoutSecs")]
    pub timeout_secs: Option<u64>,

    /// Caller priority for the limiter (0 is highest).
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Limiter resource class (a key of `limiter.classes`).
    #[serde(default = "default_resource_class", alias = "resourceClass")]
    pub resource_class: String,

    /// Extract fenced code blocks into a structured payload.
    #[serde(default)]
    pub artifacts: bool,
}

/// Accepted values of [`WorkerConfig::kind`]. `custom` marks a worker whose
/// implementation is supplied in code rather than built from config.
pub const WORKER_KINDS: &[&str] = &["llm", "echo", "custom"];

fn default_worker_kind() -> String {
    "llm".into()
}
fn default_worker_temperature() -> f64 {
    0.3
}
fn default_priority() -> u8 {
    2
}
fn default_resource_class() -> String {
    "default".into()
}

impl WorkerConfig {
    /// A worker with the given id and all other fields defaulted.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            senses: Vec::new(),
            keywords: Vec::new(),
            kind: default_worker_kind(),
            model: None,
            system_prompt: None,
            temperature: default_worker_temperature(),
            timeout_secs: None,
            priority: default_priority(),
            resource_class: default_resource_class(),
            artifacts: false,
        }
    }
}

// ── Router ───────────────────────────────────────────────────────────────

/// Semantic router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Initial similarity threshold.
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Lower clamp for the threshold.
    #[serde(default = "default_min_threshold", alias = "minThreshold")]
    pub min_threshold: f32,

    /// Upper clamp for the threshold.
    #[serde(default = "default_max_threshold", alias = "maxThreshold")]
    pub max_threshold: f32,

    /// Maximum number of workers per request.
    #[serde(default = "default_max_fanout", alias = "maxFanout")]
    pub max_fanout: usize,

    /// Hard character ceiling for the embedded prefix.
    #[serde(default = "default_prefix_chars", alias = "prefixChars")]
    pub prefix_chars: usize,

    /// Worker chosen when nothing else matches.
    #[serde(default = "default_worker", alias = "defaultWorker")]
    pub default_worker: String,

    /// Overlapping worker pairs of which only the higher-scoring survives.
    #[serde(default = "default_exclusive_pairs", alias = "exclusivePairs")]
    pub exclusive_pairs: Vec<[String; 2]>,

    /// Dimension of the built-in hash embedder.
    #[serde(default = "default_dimension", alias = "embeddingDimension")]
    pub embedding_dimension: usize,
}

fn default_threshold() -> f32 {
    0.30
}
fn default_min_threshold() -> f32 {
    0.20
}
fn default_max_threshold() -> f32 {
    0.45
}
fn default_max_fanout() -> usize {
    3
}
fn default_prefix_chars() -> usize {
    1000
}
fn default_worker() -> String {
    "echo".into()
}
fn default_exclusive_pairs() -> Vec<[String; 2]> {
    vec![["memex".into(), "iolaax".into()]]
}
fn default_dimension() -> usize {
    384
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
            max_fanout: default_max_fanout(),
            prefix_chars: default_prefix_chars(),
            default_worker: default_worker(),
            exclusive_pairs: default_exclusive_pairs(),
            embedding_dimension: default_dimension(),
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────

/// Worker dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Default per-worker timeout in seconds.
    #[serde(default = "default_worker_timeout", alias = "workerTimeoutSecs")]
    pub worker_timeout_secs: u64,

    /// Maximum concurrent pipeline runs.
    #[serde(default = "default_max_inflight", alias = "maxInflight")]
    pub max_inflight: usize,

    /// Capacity of the pipeline event channel.
    #[serde(default = "default_event_buffer", alias = "eventBuffer")]
    pub event_buffer: usize,
}

fn default_worker_timeout() -> u64 {
    20
}
fn default_max_inflight() -> usize {
    8
}
fn default_event_buffer() -> usize {
    256
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_timeout_secs: default_worker_timeout(),
            max_inflight: default_max_inflight(),
            event_buffer: default_event_buffer(),
        }
    }
}

// ── Circuit ──────────────────────────────────────────────────────────────

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open a circuit.
    #[serde(default = "default_failure_threshold", alias = "failureThreshold")]
    pub failure_threshold: u32,

    /// Pipeline ticks an open circuit waits before going half-open.
    #[serde(default = "default_cooldown_ticks", alias = "cooldownTicks")]
    pub cooldown_ticks: u32,

    /// Failures further apart than this do not accumulate.
    #[serde(default = "default_observation_window", alias = "observationWindowSecs")]
    pub observation_window_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_ticks() -> u32 {
    5
}
fn default_observation_window() -> u64 {
    60
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ticks: default_cooldown_ticks(),
            observation_window_secs: default_observation_window(),
        }
    }
}

// ── Limiter ──────────────────────────────────────────────────────────────

/// Ceilings for one resource class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// Requests per minute.
    pub rpm: u32,
    /// Tokens per minute.
    pub tpm: u64,
    /// Tokens per hour; `None` means unbounded.
    #[serde(default)]
    pub tph: Option<u64>,
    /// Tokens per day.
    pub tpd: u64,
}

impl ResourceLimits {
    /// Ceilings with no hourly bound.
    pub const fn new(rpm: u32, tpm: u64, tpd: u64) -> Self {
        Self {
            rpm,
            tpm,
            tph: None,
            tpd,
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Ceilings per resource class.
    #[serde(default = "default_classes")]
    pub classes: HashMap<String, ResourceLimits>,

    /// Longest time `acquire` waits for budget, in seconds.
    #[serde(default = "default_max_queue_wait", alias = "maxQueueWaitSecs")]
    pub max_queue_wait_secs: u64,

    /// Cooldown after a rate-limit failure, indexed by priority; the last
    /// entry applies to every lower priority.
    #[serde(default = "default_priority_cooldowns", alias = "priorityCooldownsSecs")]
    pub priority_cooldowns_secs: Vec<u64>,

    /// Rate-limit failures across all callers that trip the global cooldown.
    #[serde(default = "default_global_threshold", alias = "globalFailureThreshold")]
    pub global_failure_threshold: usize,

    /// Span in which global failures are counted, in seconds.
    #[serde(default = "default_global_span", alias = "globalSpanSecs")]
    pub global_span_secs: u64,

    /// Length of the global cooldown, in seconds.
    #[serde(default = "default_global_cooldown", alias = "globalCooldownSecs")]
    pub global_cooldown_secs: u64,

    /// Fraction of the TPM ceiling at which calls are blocked.
    #[serde(default = "default_tpm_ratio", alias = "tpmBlockRatio")]
    pub tpm_block_ratio: f64,

    /// Fraction of the TPD ceiling at which calls are blocked.
    #[serde(default = "default_tpd_ratio", alias = "tpdBlockRatio")]
    pub tpd_block_ratio: f64,
}

fn default_classes() -> HashMap<String, ResourceLimits> {
    HashMap::from([
        ("primary".into(), ResourceLimits::new(30, 30_000, 500_000)),
        ("fallback".into(), ResourceLimits::new(60, 6_000, 500_000)),
        ("default".into(), ResourceLimits::new(30, 6_000, 500_000)),
    ])
}
fn default_max_queue_wait() -> u64 {
    30
}
fn default_priority_cooldowns() -> Vec<u64> {
    vec![2, 5, 10, 15, 20, 30]
}
fn default_global_threshold() -> usize {
    5
}
fn default_global_span() -> u64 {
    60
}
fn default_global_cooldown() -> u64 {
    60
}
fn default_tpm_ratio() -> f64 {
    0.90
}
fn default_tpd_ratio() -> f64 {
    0.95
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            classes: default_classes(),
            max_queue_wait_secs: default_max_queue_wait(),
            priority_cooldowns_secs: default_priority_cooldowns(),
            global_failure_threshold: default_global_threshold(),
            global_span_secs: default_global_span(),
            global_cooldown_secs: default_global_cooldown(),
            tpm_block_ratio: default_tpm_ratio(),
            tpd_block_ratio: default_tpd_ratio(),
        }
    }
}

// ── Cache ────────────────────────────────────────────────────────────────

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether the cache is consulted at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of entries.
    #[serde(default = "default_cache_entries", alias = "maxEntries")]
    pub max_entries: usize,

    /// Default time-to-live in seconds.
    #[serde(default = "default_cache_ttl", alias = "ttlSecs")]
    pub ttl_secs: u64,

    /// Highest temperature eligible for caching.
    #[serde(default = "default_cache_temperature", alias = "maxTemperature")]
    pub max_temperature: f64,
}

fn default_cache_entries() -> usize {
    200
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_cache_temperature() -> f64 {
    0.4
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_entries(),
            ttl_secs: default_cache_ttl(),
            max_temperature: default_cache_temperature(),
        }
    }
}

// ── Tuner ────────────────────────────────────────────────────────────────

/// Pipeline tuner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerConfig {
    /// Whether skip and sample rules are applied.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Samples kept per stage.
    #[serde(default = "default_tuner_window")]
    pub window: usize,

    /// Consecutive zero-yield enrichment runs before skipping.
    #[serde(default = "default_enrichment_idle", alias = "enrichmentIdleRuns")]
    pub enrichment_idle_runs: usize,

    /// While skipping enrichment, run it anyway every this many calls.
    #[serde(default = "default_probe_every", alias = "enrichmentProbeEvery")]
    pub enrichment_probe_every: u64,

    /// Consecutive clean validation runs before sampling starts.
    #[serde(default = "default_validation_clean", alias = "validationCleanRuns")]
    pub validation_clean_runs: usize,

    /// While sampling, validate one run in this many.
    #[serde(default = "default_validation_sample", alias = "validationSampleEvery")]
    pub validation_sample_every: u64,

    /// Consecutive routings of one kind before the threshold moves.
    #[serde(default = "default_threshold_streak", alias = "thresholdStreak")]
    pub threshold_streak: usize,

    /// Size of one threshold nudge.
    #[serde(default = "default_threshold_step", alias = "thresholdStep")]
    pub threshold_step: f32,
}

fn default_tuner_window() -> usize {
    50
}
fn default_enrichment_idle() -> usize {
    10
}
fn default_probe_every() -> u64 {
    10
}
fn default_validation_clean() -> usize {
    20
}
fn default_validation_sample() -> u64 {
    5
}
fn default_threshold_streak() -> usize {
    10
}
fn default_threshold_step() -> f32 {
    0.02
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: default_tuner_window(),
            enrichment_idle_runs: default_enrichment_idle(),
            enrichment_probe_every: default_probe_every(),
            validation_clean_runs: default_validation_clean(),
            validation_sample_every: default_validation_sample(),
            threshold_streak: default_threshold_streak(),
            threshold_step: default_threshold_step(),
        }
    }
}

// ── Admission ────────────────────────────────────────────────────────────

/// Admission gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Longest accepted input, in characters.
    #[serde(default = "default_max_input", alias = "maxInputChars")]
    pub max_input_chars: usize,

    /// Recent request fingerprints remembered.
    #[serde(default = "default_fingerprint_capacity", alias = "fingerprintCapacity")]
    pub fingerprint_capacity: usize,

    /// Window in which an identical request is rejected, in seconds.
    #[serde(default = "default_fingerprint_window", alias = "fingerprintWindowSecs")]
    pub fingerprint_window_secs: u64,

    /// Inputs with this many words or more never take the fast path.
    #[serde(default = "default_greeting_words", alias = "greetingMaxWords")]
    pub greeting_max_words: usize,
}

fn default_max_input() -> usize {
    5000
}
fn default_fingerprint_capacity() -> usize {
    50
}
fn default_fingerprint_window() -> u64 {
    60
}
fn default_greeting_words() -> usize {
    6
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_input_chars: default_max_input(),
            fingerprint_capacity: default_fingerprint_capacity(),
            fingerprint_window_secs: default_fingerprint_window(),
            greeting_max_words: default_greeting_words(),
        }
    }
}

// ── Repair ───────────────────────────────────────────────────────────────

/// Repair loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Whether failed tasks are repaired at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cap on the rate-limit cooldown sleep, in seconds.
    #[serde(default = "default_max_backoff", alias = "maxBackoffSecs")]
    pub max_backoff_secs: u64,
}

fn default_max_backoff() -> u64 {
    65
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_backoff_secs: default_max_backoff(),
        }
    }
}
