//! Semantic router.
//!
//! Maps request text to a ranked set of worker ids. Every worker profile
//! carries one or more reference vectors ("senses") embedded at startup; a
//! request is embedded once and scored against every sense, keeping each
//! worker's best match.
//!
//! # Routing algorithm
//!
//! 1. Embed a bounded prefix of the input (see [`embedding_prefix`]).
//! 2. Score each worker by its best sense, times the optional learned bias.
//! 3. Keep workers at or above the current threshold.
//! 4. Of each exclusive pair, keep only the higher-scoring member.
//! 5. Drop workers whose caller budget is in a rate-limit cooldown.
//! 6. Cap at the maximum fan-out.
//!
//! When embedding fails or nothing survives, keyword matching runs instead;
//! when no keyword matches, the default worker is returned alone. The
//! result is never empty.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use switchyard_types::config::{RouterConfig, WorkerConfig};
use switchyard_types::{RoutingDecision, RoutingMethod, ScoredWorker};
use tracing::{debug, warn};

use crate::collaborators::RelevanceBias;
use crate::embeddings::{Embedder, cosine_similarity};
use crate::limiter::RateLimiter;

/// A worker's routing profile. Built once, shared read-only.
#[derive(Debug, Clone)]
pub struct WorkerProfile {
    pub id: String,
    /// Reference vectors; empty when the worker is keyword-only.
    pub senses: Vec<Vec<f32>>,
    /// Lowercase keywords for the fallback matcher.
    pub keywords: Vec<String>,
}

impl WorkerProfile {
    /// Best cosine similarity of `vector` against this profile's senses.
    pub fn best_similarity(&self, vector: &[f32]) -> f32 {
        self.senses
            .iter()
            .map(|sense| cosine_similarity(sense, vector))
            .fold(0.0, f32::max)
    }

    /// Number of keywords contained in `lower`.
    fn keyword_hits(&self, lower: &str) -> usize {
        self.keywords
            .iter()
            .filter(|k| !k.is_empty() && lower.contains(k.as_str()))
            .count()
    }
}

/// Cut `text` to a prefix suitable for embedding.
///
/// The text is split into paragraph blocks. The first block is always kept
/// whole. Further blocks are appended while the total stays within
/// `ceiling` characters; the first block that does not fit is cut at its
/// last sentence boundary inside the remaining budget, and nothing after it
/// is kept.
pub fn embedding_prefix(text: &str, ceiling: usize) -> String {
    let mut blocks = text.split("\n\n").map(str::trim).filter(|b| !b.is_empty());
    let Some(first) = blocks.next() else {
        return String::new();
    };
    let mut out = first.to_string();
    let mut used = first.chars().count();

    for block in blocks {
        // Separator counts against the ceiling.
        let remaining = ceiling.saturating_sub(used + 2);
        let len = block.chars().count();
        if len <= remaining {
            out.push_str("\n\n");
            out.push_str(block);
            used += len + 2;
            continue;
        }
        if let Some(partial) = cut_at_sentence(block, remaining) {
            out.push_str("\n\n");
            out.push_str(partial);
        }
        break;
    }
    out
}

/// Longest prefix of `block` within `max_chars` ending in `.`, `!` or `?`.
fn cut_at_sentence(block: &str, max_chars: usize) -> Option<&str> {
    let mut last_end = None;
    for (count, (idx, ch)) in block.char_indices().enumerate() {
        if count >= max_chars {
            break;
        }
        if matches!(ch, '.' | '!' | '?') {
            last_end = Some(idx + ch.len_utf8());
        }
    }
    last_end.map(|end| &block[..end])
}

/// Routes requests to workers.
pub struct SemanticRouter {
    config: RouterConfig,
    profiles: Arc<Vec<WorkerProfile>>,
    embedder: Option<Arc<dyn Embedder>>,
    bias: Option<Arc<dyn RelevanceBias>>,
    limiter: Option<Arc<RateLimiter>>,
    /// Current threshold as `f32` bits.
    threshold: AtomicU32,
}

impl SemanticRouter {
    /// Build profiles for `workers`, embedding every sense up front.
    ///
    /// A worker whose senses cannot be embedded is routed by keyword only.
    pub async fn build(
        config: RouterConfig,
        workers: &[WorkerConfig],
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        let mut profiles = Vec::with_capacity(workers.len());
        for worker in workers {
            let senses = match (&embedder, worker.senses.is_empty()) {
                (Some(embedder), false) => match embedder.embed_batch(&worker.senses).await {
                    Ok(vectors) => vectors,
                    Err(e) => {
                        warn!(worker = %worker.id, error = %e, "sense embedding failed, keyword routing only");
                        Vec::new()
                    }
                },
                _ => Vec::new(),
            };
            profiles.push(WorkerProfile {
                id: worker.id.clone(),
                senses,
                keywords: worker.keywords.iter().map(|k| k.to_lowercase()).collect(),
            });
        }
        debug!(profiles = profiles.len(), "router profiles built");
        Self::from_profiles(config, profiles, embedder)
    }

    /// Router over prebuilt profiles.
    pub fn from_profiles(
        config: RouterConfig,
        profiles: Vec<WorkerProfile>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        let initial = config
            .threshold
            .clamp(config.min_threshold, config.max_threshold);
        Self {
            threshold: AtomicU32::new(initial.to_bits()),
            config,
            profiles: Arc::new(profiles),
            embedder,
            bias: None,
            limiter: None,
        }
    }

    pub fn with_bias(mut self, bias: Arc<dyn RelevanceBias>) -> Self {
        self.bias = Some(bias);
        self
    }

    /// Exclude workers that are cooling down in `limiter`.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn profiles(&self) -> &[WorkerProfile] {
        &self.profiles
    }

    pub fn threshold(&self) -> f32 {
        f32::from_bits(self.threshold.load(Ordering::Relaxed))
    }

    /// Move the threshold by `delta`, clamped to the configured range.
    /// Returns the new value.
    pub fn nudge_threshold(&self, delta: f32) -> f32 {
        let (min, max) = (self.config.min_threshold, self.config.max_threshold);
        let mut current = self.threshold.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + delta).clamp(min, max);
            match self.threshold.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn max_fanout(&self) -> usize {
        self.config.max_fanout.max(1)
    }

    pub fn default_worker(&self) -> &str {
        &self.config.default_worker
    }

    /// Route `text` to at least one and at most `max_fanout` workers.
    pub async fn route(&self, text: &str) -> RoutingDecision {
        if let Some(decision) = self.route_semantic(text).await {
            return decision;
        }
        if let Some(decision) = self.route_keywords(text) {
            return decision;
        }
        debug!(worker = %self.config.default_worker, "no route matched, using default worker");
        RoutingDecision::single(self.config.default_worker.clone(), RoutingMethod::Default)
    }

    async fn route_semantic(&self, text: &str) -> Option<RoutingDecision> {
        let embedder = self.embedder.as_ref()?;
        let prefix = embedding_prefix(text, self.config.prefix_chars);
        if prefix.is_empty() {
            return None;
        }
        let vector = match embedder.embed(&prefix).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "embedding failed, falling back to keywords");
                return None;
            }
        };

        let bias = match &self.bias {
            Some(bias) => bias.bias_for(text).await,
            None => Default::default(),
        };
        let threshold = self.threshold();

        let mut scored: Vec<ScoredWorker> = self
            .profiles
            .iter()
            .filter(|p| !p.senses.is_empty())
            .map(|p| {
                let multiplier = bias.get(&p.id).copied().unwrap_or(1.0);
                ScoredWorker {
                    worker: p.id.clone(),
                    confidence: p.best_similarity(&vector) * multiplier,
                }
            })
            .filter(|s| s.confidence >= threshold)
            .collect();
        scored.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let scored = self.finish(scored);
        debug!(
            threshold,
            selected = ?scored.iter().map(|s| s.worker.as_str()).collect::<Vec<_>>(),
            "semantic routing"
        );
        (!scored.is_empty()).then_some(RoutingDecision {
            workers: scored,
            method: RoutingMethod::Semantic,
        })
    }

    /// Keyword routing: workers ordered by keyword hits, ties in profile
    /// order. Every match has confidence 1.0.
    pub fn route_keywords(&self, text: &str) -> Option<RoutingDecision> {
        let lower = text.to_lowercase();
        let mut hits: Vec<(usize, &WorkerProfile)> = self
            .profiles
            .iter()
            .map(|p| (p.keyword_hits(&lower), p))
            .filter(|(n, _)| *n > 0)
            .collect();
        hits.sort_by(|a, b| b.0.cmp(&a.0));

        let scored: Vec<ScoredWorker> = hits
            .into_iter()
            .map(|(_, p)| ScoredWorker {
                worker: p.id.clone(),
                confidence: 1.0,
            })
            .collect();
        let scored = self.finish(scored);
        (!scored.is_empty()).then_some(RoutingDecision {
            workers: scored,
            method: RoutingMethod::Keyword,
        })
    }

    /// Exclusive pairs, cooldown exclusion and the fan-out cap.
    fn finish(&self, scored: Vec<ScoredWorker>) -> Vec<ScoredWorker> {
        let mut scored = apply_exclusive_pairs(scored, &self.config.exclusive_pairs);
        if let Some(limiter) = &self.limiter {
            scored.retain(|s| {
                let cooling = limiter.in_cooldown(&s.worker);
                if cooling {
                    debug!(worker = %s.worker, "skipping worker in rate-limit cooldown");
                }
                !cooling
            });
        }
        scored.truncate(self.max_fanout());
        scored
    }
}

/// Drop the lower-scoring member of every exclusive pair present in
/// `scored`. On a tie the first member of the pair survives.
fn apply_exclusive_pairs(
    mut scored: Vec<ScoredWorker>,
    pairs: &[[String; 2]],
) -> Vec<ScoredWorker> {
    for [a, b] in pairs {
        let score_a = scored.iter().find(|s| &s.worker == a).map(|s| s.confidence);
        let score_b = scored.iter().find(|s| &s.worker == b).map(|s| s.confidence);
        if let (Some(sa), Some(sb)) = (score_a, score_b) {
            let loser = if sa >= sb { b } else { a };
            scored.retain(|s| &s.worker != loser);
        }
    }
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingError, HashEmbedder};
    use crate::metrics::MetricsRegistry;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use switchyard_types::config::{LimiterConfig, builtin_workers};

    fn profile(id: &str, keywords: &[&str]) -> WorkerProfile {
        WorkerProfile {
            id: id.into(),
            senses: Vec::new(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn keyword_router(profiles: Vec<WorkerProfile>) -> SemanticRouter {
        SemanticRouter::from_profiles(RouterConfig::default(), profiles, None)
    }

    struct Failing;

    #[async_trait]
    impl Embedder for Failing {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Unavailable("down".into()))
        }
        fn dimension(&self) -> usize {
            4
        }
    }

    struct Boost(&'static str, f32);

    #[async_trait]
    impl RelevanceBias for Boost {
        async fn bias_for(&self, _text: &str) -> HashMap<String, f32> {
            HashMap::from([(self.0.to_string(), self.1)])
        }
    }

    #[test]
    fn prefix_keeps_first_block_whole() {
        let first = "x".repeat(50);
        assert_eq!(embedding_prefix(&first, 10), first);
    }

    #[test]
    fn prefix_appends_blocks_within_ceiling() {
        let text = "one.\n\ntwo.\n\nthree.";
        assert_eq!(embedding_prefix(text, 100), "one.\n\ntwo.\n\nthree.");
    }

    #[test]
    fn prefix_cuts_partial_block_at_sentence() {
        let text = "Intro.\n\nFirst point. Second point is much longer than the rest.";
        let out = embedding_prefix(text, 30);
        assert_eq!(out, "Intro.\n\nFirst point.");
    }

    #[test]
    fn prefix_drops_partial_block_without_sentence_end() {
        let text = "Intro.\n\nno sentence end here at all";
        assert_eq!(embedding_prefix(text, 15), "Intro.");
        assert_eq!(embedding_prefix("  \n\n ", 15), "");
    }

    #[tokio::test]
    async fn keyword_fallback_never_empty() {
        let router = keyword_router(vec![profile("cipher", &["bitcoin"]), profile("echo", &[])]);
        let decision = router.route("tell me a story").await;
        assert_eq!(decision.worker_ids(), vec!["echo".to_string()]);
        assert_eq!(decision.method, RoutingMethod::Default);
    }

    #[tokio::test]
    async fn keyword_match_is_case_insensitive() {
        let router = keyword_router(vec![profile("cipher", &["bitcoin"])]);
        let decision = router.route("What about BITCOIN?").await;
        assert_eq!(decision.worker_ids(), vec!["cipher".to_string()]);
        assert_eq!(decision.method, RoutingMethod::Keyword);
    }

    #[tokio::test]
    async fn exclusive_pair_drops_second_member_on_tie() {
        let router = keyword_router(vec![
            profile("iolaax", &["code"]),
            profile("memex", &["explain"]),
        ]);
        let decision = router.route("explain this code").await;
        assert_eq!(decision.worker_ids(), vec!["memex".to_string()]);
    }

    #[tokio::test]
    async fn fanout_capped() {
        let router = keyword_router(vec![
            profile("a", &["x"]),
            profile("b", &["x"]),
            profile("c", &["x"]),
            profile("d", &["x"]),
        ]);
        assert_eq!(router.route("x").await.fanout(), 3);
    }

    #[tokio::test]
    async fn more_keyword_hits_rank_first() {
        let router = keyword_router(vec![
            profile("vita", &["sleep"]),
            profile("chronos", &["schedule", "sleep"]),
        ]);
        let decision = router.route("schedule my sleep").await;
        assert_eq!(decision.worker_ids(), vec!["chronos".to_string(), "vita".to_string()]);
    }

    #[tokio::test]
    async fn embedder_failure_uses_keywords() {
        let router = SemanticRouter::from_profiles(
            RouterConfig::default(),
            vec![profile("cipher", &["bitcoin"])],
            Some(Arc::new(Failing)),
        );
        let decision = router.route("bitcoin").await;
        assert_eq!(decision.method, RoutingMethod::Keyword);
    }

    #[tokio::test]
    async fn semantic_routes_to_matching_sense() {
        let mut workers = builtin_workers();
        workers.retain(|w| w.id == "cipher" || w.id == "vita" || w.id == "echo");
        let router = SemanticRouter::build(
            RouterConfig::default(),
            &workers,
            Some(Arc::new(HashEmbedder::default_dimension())),
        )
        .await;
        let sense = workers
            .iter()
            .find(|w| w.id == "cipher")
            .map(|w| w.senses[0].clone())
            .unwrap();
        let decision = router.route(&sense).await;
        assert_eq!(decision.method, RoutingMethod::Semantic);
        assert_eq!(decision.workers[0].worker, "cipher");
        assert!(decision.workers[0].confidence > 0.99);
    }

    #[tokio::test]
    async fn bias_scales_scores() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        let vector = embedder.embed("bitcoin wallet").await.unwrap();
        let profiles = vec![WorkerProfile {
            id: "cipher".into(),
            senses: vec![vector],
            keywords: Vec::new(),
        }];
        let router = SemanticRouter::from_profiles(RouterConfig::default(), profiles, Some(embedder))
            .with_bias(Arc::new(Boost("cipher", 0.1)));
        let decision = router.route("bitcoin wallet").await;
        assert_eq!(decision.method, RoutingMethod::Default);
    }

    #[tokio::test]
    async fn cooling_worker_excluded() {
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig::default(),
            Arc::new(MetricsRegistry::new()),
        ));
        limiter.record_failure("cipher", 2);
        let router = keyword_router(vec![profile("cipher", &["bitcoin"]), profile("spark", &["bitcoin"])])
            .with_limiter(limiter);
        let decision = router.route("bitcoin").await;
        assert_eq!(decision.worker_ids(), vec!["spark".to_string()]);
    }

    #[test]
    fn threshold_nudges_clamped() {
        let router = keyword_router(vec![]);
        assert!((router.threshold() - 0.30).abs() < 1e-6);
        assert!((router.nudge_threshold(-0.02) - 0.28).abs() < 1e-6);
        for _ in 0..20 {
            router.nudge_threshold(-0.02);
        }
        assert!((router.threshold() - 0.20).abs() < 1e-6);
        for _ in 0..20 {
            router.nudge_threshold(0.02);
        }
        assert!((router.threshold() - 0.45).abs() < 1e-6);
    }

    #[test]
    fn exclusive_pairs_higher_score_wins() {
        let scored = vec![
            ScoredWorker { worker: "iolaax".into(), confidence: 0.6 },
            ScoredWorker { worker: "memex".into(), confidence: 0.5 },
        ];
        let pairs = [["memex".to_string(), "iolaax".to_string()]];
        let out = apply_exclusive_pairs(scored, &pairs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].worker, "iolaax");
    }
}
