//! Per-caller usage accounting.
//!
//! Every caller (a worker id, from the limiter's point of view) owns one
//! [`AgentMetrics`] behind its own `parking_lot::Mutex`. The
//! [`MetricsRegistry`] hands out `Arc` handles so no lock ever spans more
//! than one caller.
//!
//! # Windows
//!
//! Request instants are kept for the last minute and token samples for the
//! last day. Minute and hour token totals are computed from the day samples,
//! so a single queue serves all three token windows.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

pub(crate) const MINUTE: Duration = Duration::from_secs(60);
pub(crate) const HOUR: Duration = Duration::from_secs(60 * 60);
pub(crate) const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// ── AgentMetrics ─────────────────────────────────────────────────────────

/// Sliding-window counters and lifetime totals for one caller.
#[derive(Debug, Default)]
pub struct AgentMetrics {
    /// Request instants within the last minute, oldest first.
    requests: VecDeque<Instant>,
    /// Token samples within the last day, oldest first.
    tokens: VecDeque<(Instant, u64)>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    total_requests: u64,
    total_tokens: u64,
    rate_limit_hits: u64,
    invocations: u64,
    invocation_failures: u64,
    total_latency: Duration,
}

impl AgentMetrics {
    fn prune(&mut self, now: Instant) {
        while let Some(&ts) = self.requests.front() {
            if now.saturating_duration_since(ts) >= MINUTE {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        while let Some(&(ts, _)) = self.tokens.front() {
            if now.saturating_duration_since(ts) >= DAY {
                self.tokens.pop_front();
            } else {
                break;
            }
        }
    }

    /// Requests counted in the minute window ending at `now`.
    pub fn requests_last_minute(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.requests.len() as u32
    }

    /// Tokens counted in the window of length `span` ending at `now`.
    pub fn tokens_within(&mut self, now: Instant, span: Duration) -> u64 {
        self.prune(now);
        self.tokens
            .iter()
            .filter(|(ts, _)| now.saturating_duration_since(*ts) < span)
            .map(|(_, n)| n)
            .sum()
    }

    /// Time until the oldest request leaves the minute window.
    pub(crate) fn request_window_reset(&self, now: Instant) -> Duration {
        self.requests
            .front()
            .map(|ts| MINUTE.saturating_sub(now.saturating_duration_since(*ts)))
            .unwrap_or_default()
    }

    /// Time until the oldest token sample inside `span` leaves it.
    pub(crate) fn token_window_reset(&self, now: Instant, span: Duration) -> Duration {
        self.tokens
            .iter()
            .find(|(ts, _)| now.saturating_duration_since(*ts) < span)
            .map(|(ts, _)| span.saturating_sub(now.saturating_duration_since(*ts)))
            .unwrap_or_default()
    }

    pub fn record_request(&mut self, now: Instant) {
        self.prune(now);
        self.requests.push_back(now);
        self.total_requests += 1;
    }

    pub fn record_tokens(&mut self, now: Instant, tokens: u64) {
        if tokens == 0 {
            return;
        }
        self.prune(now);
        self.tokens.push_back((now, tokens));
        self.total_tokens += tokens;
    }

    /// Register a rate-limit failure and start a cooldown of `cooldown`.
    pub fn record_rate_limit(&mut self, now: Instant, cooldown: Duration) {
        self.consecutive_failures += 1;
        self.rate_limit_hits += 1;
        let until = now + cooldown;
        self.cooldown_until = Some(match self.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record one finished invocation with its wall time.
    pub fn record_invocation(&mut self, elapsed: Duration, ok: bool) {
        self.invocations += 1;
        self.total_latency += elapsed;
        if !ok {
            self.invocation_failures += 1;
        }
    }

    /// Remaining cooldown at `now`, if any.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Point-in-time view for status reporting.
    pub fn snapshot(&mut self, now: Instant) -> MetricsSnapshot {
        let avg_latency_ms = if self.invocations == 0 {
            0.0
        } else {
            self.total_latency.as_secs_f64() * 1000.0 / self.invocations as f64
        };
        MetricsSnapshot {
            requests_per_minute: self.requests_last_minute(now),
            tokens_per_minute: self.tokens_within(now, MINUTE),
            tokens_per_hour: self.tokens_within(now, HOUR),
            tokens_per_day: self.tokens_within(now, DAY),
            consecutive_failures: self.consecutive_failures,
            cooldown_remaining_ms: self
                .cooldown_remaining(now)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            total_requests: self.total_requests,
            total_tokens: self.total_tokens,
            rate_limit_hits: self.rate_limit_hits,
            invocations: self.invocations,
            invocation_failures: self.invocation_failures,
            avg_latency_ms,
        }
    }
}

/// Serializable copy of one caller's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub tokens_per_hour: u64,
    pub tokens_per_day: u64,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: u64,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub rate_limit_hits: u64,
    pub invocations: u64,
    pub invocation_failures: u64,
    pub avg_latency_ms: f64,
}

// ── MetricsRegistry ──────────────────────────────────────────────────────

/// Concurrent map of caller id to its metrics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    callers: DashMap<String, Arc<Mutex<AgentMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the caller's metrics, created on first use.
    pub fn caller(&self, caller: &str) -> Arc<Mutex<AgentMetrics>> {
        if let Some(existing) = self.callers.get(caller) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.callers
                .entry(caller.to_string())
                .or_default()
                .value(),
        )
    }

    /// Snapshot of one caller, `None` if it was never seen.
    pub fn snapshot(&self, caller: &str) -> Option<MetricsSnapshot> {
        let handle = self.callers.get(caller).map(|e| Arc::clone(e.value()))?;
        let mut m = handle.lock();
        Some(m.snapshot(Instant::now()))
    }

    /// Snapshots of every known caller, sorted by id.
    pub fn snapshots(&self) -> Vec<(String, MetricsSnapshot)> {
        let now = Instant::now();
        let handles: Vec<(String, Arc<Mutex<AgentMetrics>>)> = self
            .callers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut out: Vec<_> = handles
            .into_iter()
            .map(|(id, h)| {
                let snap = h.lock().snapshot(now);
                (id, snap)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Number of tracked callers.
    pub fn len(&self) -> usize {
        self.callers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_leave_minute_window() {
        let mut m = AgentMetrics::default();
        let t0 = Instant::now();
        m.record_request(t0);
        m.record_request(t0 + Duration::from_secs(30));
        assert_eq!(m.requests_last_minute(t0 + Duration::from_secs(59)), 2);
        assert_eq!(m.requests_last_minute(t0 + Duration::from_secs(61)), 1);
        assert_eq!(m.requests_last_minute(t0 + Duration::from_secs(91)), 0);
    }

    #[test]
    fn token_windows_nest() {
        let mut m = AgentMetrics::default();
        let t0 = Instant::now();
        m.record_tokens(t0, 100);
        m.record_tokens(t0 + Duration::from_secs(120), 50);
        let now = t0 + Duration::from_secs(130);
        assert_eq!(m.tokens_within(now, MINUTE), 50);
        assert_eq!(m.tokens_within(now, HOUR), 150);
        assert_eq!(m.tokens_within(now, DAY), 150);
    }

    #[test]
    fn zero_tokens_not_recorded() {
        let mut m = AgentMetrics::default();
        m.record_tokens(Instant::now(), 0);
        assert_eq!(m.snapshot(Instant::now()).total_tokens, 0);
    }

    #[test]
    fn rate_limit_sets_cooldown_and_success_clears_streak() {
        let mut m = AgentMetrics::default();
        let t0 = Instant::now();
        m.record_rate_limit(t0, Duration::from_secs(5));
        assert!(m.cooldown_remaining(t0 + Duration::from_secs(4)).is_some());
        assert!(m.cooldown_remaining(t0 + Duration::from_secs(5)).is_none());

        let snap = m.snapshot(t0);
        assert_eq!(snap.consecutive_failures, 1);
        assert_eq!(snap.rate_limit_hits, 1);

        m.record_success();
        assert_eq!(m.snapshot(t0).consecutive_failures, 0);
    }

    #[test]
    fn shorter_cooldown_does_not_shrink_existing() {
        let mut m = AgentMetrics::default();
        let t0 = Instant::now();
        m.record_rate_limit(t0, Duration::from_secs(30));
        m.record_rate_limit(t0, Duration::from_secs(2));
        assert!(m.cooldown_remaining(t0 + Duration::from_secs(10)).is_some());
    }

    #[test]
    fn request_window_reset_points_at_oldest() {
        let mut m = AgentMetrics::default();
        let t0 = Instant::now();
        m.record_request(t0);
        let wait = m.request_window_reset(t0 + Duration::from_secs(45));
        assert_eq!(wait, Duration::from_secs(15));
    }

    #[test]
    fn invocation_latency_average() {
        let mut m = AgentMetrics::default();
        m.record_invocation(Duration::from_millis(10), true);
        m.record_invocation(Duration::from_millis(30), false);
        let snap = m.snapshot(Instant::now());
        assert_eq!(snap.invocations, 2);
        assert_eq!(snap.invocation_failures, 1);
        assert!((snap.avg_latency_ms - 20.0).abs() < 0.01);
    }

    #[test]
    fn registry_shares_handles() {
        let reg = MetricsRegistry::new();
        let a = reg.caller("cipher");
        let b = reg.caller("cipher");
        assert!(Arc::ptr_eq(&a, &b));
        a.lock().record_request(Instant::now());
        assert_eq!(reg.snapshot("cipher").unwrap().total_requests, 1);
        assert!(reg.snapshot("unknown").is_none());
    }

    #[test]
    fn registry_snapshots_sorted() {
        let reg = MetricsRegistry::new();
        reg.caller("vita");
        reg.caller("cipher");
        let ids: Vec<_> = reg.snapshots().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["cipher".to_string(), "vita".to_string()]);
        assert_eq!(reg.len(), 2);
    }
}
