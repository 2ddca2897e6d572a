//! Routing decisions produced by the semantic router.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a routing decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMethod {
    /// Vector similarity against worker profiles.
    Semantic,
    /// Keyword-set matching.
    Keyword,
    /// Nothing matched; the default conversational worker was chosen.
    Default,
}

impl fmt::Display for RoutingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Semantic => "semantic",
            Self::Keyword => "keyword",
            Self::Default => "default",
        };
        f.write_str(s)
    }
}

/// A worker selected by the router with its confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredWorker {
    /// Worker id.
    pub worker: String,
    /// Similarity score after bias, or 1.0 for keyword/default picks.
    pub confidence: f32,
}

/// Ordered list of selected workers, highest confidence first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Selected workers, never empty.
    pub workers: Vec<ScoredWorker>,
    /// The method that produced this decision.
    pub method: RoutingMethod,
}

impl RoutingDecision {
    /// A decision naming a single worker.
    pub fn single(worker: impl Into<String>, method: RoutingMethod) -> Self {
        Self {
            workers: vec![ScoredWorker {
                worker: worker.into(),
                confidence: 1.0,
            }],
            method,
        }
    }

    /// Worker ids in routed order.
    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.worker.clone()).collect()
    }

    /// Number of selected workers.
    pub fn fanout(&self) -> usize {
        self.workers.len()
    }
}
