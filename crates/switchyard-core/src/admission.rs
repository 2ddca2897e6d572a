//! Admission gate and greeting fast path.
//!
//! Every request passes [`AdmissionGate::admit`] before anything else runs:
//!
//! 1. Empty input is refused.
//! 2. The [`SafetyRules`] collaborator is consulted. An error from it is a
//!    block (fail closed).
//! 3. A fingerprint ring of recent requests rejects exact repeats inside
//!    the window.
//!
//! Retries issued by the repair loop go through
//! [`AdmissionGate::admit_retry`], which skips step 3 but never step 2.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use switchyard_types::config::AdmissionConfig;
use tracing::{debug, warn};

use crate::collaborators::SafetyRules;

const GREETING_PATTERNS: &[&str] = &[
    r"^hallo\b",
    r"^hoi\b",
    r"^hey\b",
    r"^hi\b",
    r"^hello\b",
    r"^goede(morgen|middag|avond)\b",
    r"^good (morning|afternoon|evening)\b",
    r"^yo\b",
    r"^hoe gaat het",
    r"^how are you",
    r"^bedankt",
    r"^dank je",
    r"^thanks\b",
    r"^thank you",
    r"^doei\b",
    r"^tot ziens",
    r"^bye\b",
];

/// Verdict of the admission gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// Why the request was refused; empty when allowed.
    pub reason: String,
}

impl AdmissionDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Pre-flight safety check with duplicate suppression.
pub struct AdmissionGate {
    config: AdmissionConfig,
    rules: Arc<dyn SafetyRules>,
    fingerprints: Mutex<VecDeque<([u8; 32], Instant)>>,
    greetings: Vec<Regex>,
}

impl AdmissionGate {
    pub fn new(config: AdmissionConfig, rules: Arc<dyn SafetyRules>) -> Self {
        let greetings = GREETING_PATTERNS
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "skipping invalid greeting pattern");
                    None
                }
            })
            .collect();
        Self {
            fingerprints: Mutex::new(VecDeque::with_capacity(config.fingerprint_capacity)),
            config,
            rules,
            greetings,
        }
    }

    /// Admit a fresh request.
    pub async fn admit(&self, text: &str) -> AdmissionDecision {
        self.admit_at(text, Instant::now()).await
    }

    /// [`admit`](Self::admit) with an explicit clock.
    pub async fn admit_at(&self, text: &str, now: Instant) -> AdmissionDecision {
        let decision = self.check_safety(text).await;
        if !decision.allowed {
            return decision;
        }
        if !self.remember(text, now) {
            debug!("duplicate request rejected");
            return AdmissionDecision::deny("duplicate request");
        }
        decision
    }

    /// Admit a repair-loop retry: safety is checked, the duplicate guard is
    /// not.
    pub async fn admit_retry(&self, text: &str) -> AdmissionDecision {
        self.check_safety(text).await
    }

    async fn check_safety(&self, text: &str) -> AdmissionDecision {
        if text.trim().is_empty() {
            return AdmissionDecision::deny("empty request");
        }
        match self.rules.validate(text).await {
            Ok((true, _)) => AdmissionDecision::allow(),
            Ok((false, reason)) => {
                warn!(reason = %reason, "request blocked by safety rules");
                AdmissionDecision::deny(reason)
            }
            Err(e) => {
                warn!(error = %e, "safety check failed, blocking request");
                AdmissionDecision::deny(format!("safety check unavailable: {e}"))
            }
        }
    }

    /// Record the fingerprint of `text`. False if it was already seen
    /// inside the window.
    fn remember(&self, text: &str, now: Instant) -> bool {
        let digest: [u8; 32] = Sha256::digest(text.trim().as_bytes()).into();
        let window = Duration::from_secs(self.config.fingerprint_window_secs);
        let mut ring = self.fingerprints.lock();

        ring.retain(|(_, seen)| now.saturating_duration_since(*seen) < window);
        if ring.iter().any(|(fp, _)| *fp == digest) {
            return false;
        }
        if ring.len() >= self.config.fingerprint_capacity.max(1) {
            ring.pop_front();
        }
        ring.push_back((digest, now));
        true
    }

    /// Whether `text` is a short greeting that the fast path answers.
    pub fn is_greeting(&self, text: &str) -> bool {
        let lower = text.trim().to_lowercase();
        if lower.split_whitespace().count() >= self.config.greeting_max_words {
            return false;
        }
        self.greetings.iter().any(|re| re.is_match(&lower))
    }
}
