//! Per-worker circuit breakers.
//!
//! ```text
//!          N failures in window            cooldown ticks reach 0
//! Closed ─────────────────────────▶ Open ─────────────────────────▶ HalfOpen
//!   ▲                                 ▲                                 │
//!   │            success              │            failure              │
//!   └─────────────────────────────────┼─────────────────────────────────┤
//!                                     └─────────────────────────────────┘
//! ```
//!
//! The cooldown is counted in pipeline ticks rather than wall time: the
//! engine calls [`CircuitBreakers::tick`] once per run. Rate-limit failures
//! never reach this module.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use switchyard_types::config::CircuitConfig;
use tracing::{info, warn};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Mutable breaker state for one worker.
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub cooldown_remaining: u32,
    pub last_failure: Option<Instant>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            failure_count: 0,
            cooldown_remaining: 0,
            last_failure: None,
        }
    }
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub cooldown_remaining: u32,
}

/// Breakers for every worker, created lazily.
pub struct CircuitBreakers {
    config: CircuitConfig,
    states: DashMap<String, Arc<Mutex<CircuitState>>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    fn state(&self, worker: &str) -> Arc<Mutex<CircuitState>> {
        if let Some(existing) = self.states.get(worker) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.states.entry(worker.to_string()).or_default().value())
    }

    /// False while the worker's circuit is open.
    pub fn may_invoke(&self, worker: &str) -> bool {
        self.state(worker).lock().phase != CircuitPhase::Open
    }

    /// A success closes the circuit from any phase.
    pub fn record_success(&self, worker: &str) {
        let handle = self.state(worker);
        let mut s = handle.lock();
        if s.phase != CircuitPhase::Closed {
            info!(worker, "circuit closed");
        }
        s.phase = CircuitPhase::Closed;
        s.failure_count = 0;
        s.cooldown_remaining = 0;
    }

    pub fn record_failure(&self, worker: &str) {
        self.record_failure_at(worker, Instant::now());
    }

    /// Count a failure at `now`. Failures further apart than the
    /// observation window restart the count.
    pub fn record_failure_at(&self, worker: &str, now: Instant) {
        let window = Duration::from_secs(self.config.observation_window_secs);
        let handle = self.state(worker);
        let mut s = handle.lock();

        let stale = s
            .last_failure
            .is_some_and(|last| now.saturating_duration_since(last) > window);
        if stale {
            s.failure_count = 0;
        }
        s.failure_count += 1;
        s.last_failure = Some(now);

        let trip = match s.phase {
            CircuitPhase::HalfOpen => true,
            CircuitPhase::Closed => s.failure_count >= self.config.failure_threshold.max(1),
            CircuitPhase::Open => false,
        };
        if trip {
            s.phase = CircuitPhase::Open;
            s.cooldown_remaining = self.config.cooldown_ticks;
            warn!(
                worker,
                failures = s.failure_count,
                cooldown_ticks = s.cooldown_remaining,
                "circuit opened"
            );
        }
    }

    /// Advance every open breaker by one tick; those reaching zero become
    /// half-open.
    pub fn tick(&self) {
        for entry in self.states.iter() {
            let mut s = entry.value().lock();
            if s.phase != CircuitPhase::Open {
                continue;
            }
            s.cooldown_remaining = s.cooldown_remaining.saturating_sub(1);
            if s.cooldown_remaining == 0 {
                s.phase = CircuitPhase::HalfOpen;
                info!(worker = %entry.key(), "circuit half-open");
            }
        }
    }

    pub fn snapshot(&self, worker: &str) -> CircuitSnapshot {
        let handle = self.state(worker);
        let s = handle.lock();
        CircuitSnapshot {
            phase: s.phase,
            failure_count: s.failure_count,
            cooldown_remaining: s.cooldown_remaining,
        }
    }

    /// Workers whose circuit is currently open, sorted.
    pub fn open_workers(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .states
            .iter()
            .filter(|e| e.value().lock().phase == CircuitPhase::Open)
            .map(|e| e.key().clone())
            .collect();
        open.sort();
        open
    }
}
