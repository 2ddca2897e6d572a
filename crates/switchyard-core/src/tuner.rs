//! Self-tuning pipeline instrumentation.
//!
//! Every stage records `(latency, yield)` samples into its own bounded ring.
//! Two stages may be thinned out when their recent history shows they do
//! nothing useful:
//!
//! - **Enrichment** is skipped once its last N runs fetched zero fragments,
//!   with a periodic probe run so it can come back.
//! - **Validation** is sampled 1-in-K once its last M runs raised zero
//!   warnings, and runs every time again as soon as one warning appears.
//!
//! Admission, fast path, routing and dispatch are never skippable.
//!
//! The tuner also watches routing outcomes and proposes threshold nudges:
//! a streak of default-worker fallbacks lowers the threshold, a streak of
//! maximum fan-outs raises it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use switchyard_types::RoutingMethod;
use switchyard_types::config::TunerConfig;
use tracing::{debug, info};

/// Pipeline stages the tuner tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Admission,
    FastPath,
    Enrichment,
    Routing,
    Dispatch,
    Validation,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 6] = [
        Self::Admission,
        Self::FastPath,
        Self::Enrichment,
        Self::Routing,
        Self::Dispatch,
        Self::Validation,
    ];

    /// Whether the tuner may ever skip or sample this stage.
    pub fn is_skippable(self) -> bool {
        matches!(self, Self::Enrichment | Self::Validation)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Admission => "admission",
            Self::FastPath => "fast_path",
            Self::Enrichment => "enrichment",
            Self::Routing => "routing",
            Self::Dispatch => "dispatch",
            Self::Validation => "validation",
        };
        f.write_str(name)
    }
}

/// Rolling statistics for one stage.
#[derive(Debug, Default)]
pub struct StageStat {
    samples: VecDeque<(Duration, usize)>,
    calls: u64,
    /// Decisions taken while the skip or sample rule was active.
    gated: u64,
    skipped: u64,
}

impl StageStat {
    fn push(&mut self, latency: Duration, yielded: usize, window: usize) {
        if self.samples.len() == window.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back((latency, yielded));
        self.calls += 1;
    }

    /// True when the last `n` samples exist and all yielded nothing.
    fn idle_for(&self, n: usize) -> bool {
        n > 0
            && self.samples.len() >= n
            && self.samples.iter().rev().take(n).all(|(_, y)| *y == 0)
    }

    fn avg_latency(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().map(|(d, _)| *d).sum();
        total / self.samples.len() as u32
    }

    fn total_yield(&self) -> usize {
        self.samples.iter().map(|(_, y)| y).sum()
    }
}

/// Serializable view of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: PipelineStage,
    pub calls: u64,
    pub skipped: u64,
    pub avg_latency_ms: f64,
    pub window_yield: usize,
}

#[derive(Debug, Default)]
struct RoutingStreaks {
    fallback: usize,
    saturated: usize,
}

/// Tracks stage performance and decides which stages may be skipped.
pub struct PipelineTuner {
    config: TunerConfig,
    max_fanout: usize,
    stages: HashMap<PipelineStage, Mutex<StageStat>>,
    streaks: Mutex<RoutingStreaks>,
}

impl PipelineTuner {
    pub fn new(config: TunerConfig, max_fanout: usize) -> Self {
        let stages = PipelineStage::ALL
            .iter()
            .map(|s| (*s, Mutex::new(StageStat::default())))
            .collect();
        Self {
            config,
            max_fanout: max_fanout.max(1),
            stages,
            streaks: Mutex::new(RoutingStreaks::default()),
        }
    }

    /// Record one run of `stage`. `yielded` is the number of useful items it
    /// produced: fragments for enrichment, warnings for validation.
    pub fn record(&self, stage: PipelineStage, latency: Duration, yielded: usize) {
        if let Some(stat) = self.stages.get(&stage) {
            stat.lock().push(latency, yielded, self.config.window);
        }
    }

    /// Whether the next run of `stage` may be skipped.
    ///
    /// Each call while a rule is active counts towards the probe/sample
    /// cadence, so call it exactly once per pipeline run.
    pub fn may_skip(&self, stage: PipelineStage) -> bool {
        if !self.config.enabled || !stage.is_skippable() {
            return false;
        }
        let Some(stat) = self.stages.get(&stage) else {
            return false;
        };
        let mut stat = stat.lock();

        let (active, every) = match stage {
            PipelineStage::Enrichment => (
                stat.idle_for(self.config.enrichment_idle_runs),
                self.config.enrichment_probe_every,
            ),
            PipelineStage::Validation => (
                stat.idle_for(self.config.validation_clean_runs),
                self.config.validation_sample_every,
            ),
            _ => return false,
        };
        if !active {
            stat.gated = 0;
            return false;
        }

        stat.gated += 1;
        // Every `every`-th gated decision runs the stage.
        let run = every <= 1 || stat.gated % every == 0;
        if !run {
            stat.skipped += 1;
            debug!(stage = %stage, "tuner skipping stage");
        }
        !run
    }

    /// Record a routing outcome. Returns a threshold delta when a streak
    /// completes.
    pub fn record_routing(&self, method: RoutingMethod, fanout: usize) -> Option<f32> {
        let streak = self.config.threshold_streak;
        if !self.config.enabled || streak == 0 {
            return None;
        }
        let mut s = self.streaks.lock();
        if method == RoutingMethod::Default {
            s.fallback += 1;
        } else {
            s.fallback = 0;
        }
        if fanout >= self.max_fanout {
            s.saturated += 1;
        } else {
            s.saturated = 0;
        }

        if s.fallback >= streak {
            s.fallback = 0;
            info!(streak, "routing keeps falling back, lowering threshold");
            return Some(-self.config.threshold_step);
        }
        if s.saturated >= streak {
            s.saturated = 0;
            info!(streak, "routing keeps saturating fan-out, raising threshold");
            return Some(self.config.threshold_step);
        }
        None
    }

    pub fn stage_summaries(&self) -> Vec<StageSummary> {
        PipelineStage::ALL
            .iter()
            .filter_map(|stage| {
                let stat = self.stages.get(stage)?.lock();
                Some(StageSummary {
                    stage: *stage,
                    calls: stat.calls,
                    skipped: stat.skipped,
                    avg_latency_ms: stat.avg_latency().as_secs_f64() * 1000.0,
                    window_yield: stat.total_yield(),
                })
            })
            .collect()
    }

    /// One line per stage, for logs and the CLI.
    pub fn summary(&self) -> String {
        self.stage_summaries()
            .iter()
            .map(|s| {
                format!(
                    "{:<11} calls={:<5} skipped={:<5} avg={:.1}ms yield={}",
                    s.stage.to_string(),
                    s.calls,
                    s.skipped,
                    s.avg_latency_ms,
                    s.window_yield
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
