//! Sliding-window call budget with priority cooldowns.
//!
//! Implements a three-stage admission check per call:
//! 1. **Global cooldown** -- tripped when too many rate-limit failures
//!    arrive from all callers within a short span.
//! 2. **Caller cooldown** -- set after a rate-limit failure, its length
//!    taken from the priority table (higher priority, shorter pause).
//! 3. **Window ceilings** -- requests/minute plus tokens per minute, hour
//!    and day against the caller's resource class.
//!
//! Window state lives in the shared [`MetricsRegistry`], one lock per
//! caller. [`RateLimiter::acquire`] polls the check until budget is free or
//! the queue wait ceiling passes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use switchyard_types::config::{LimiterConfig, ResourceLimits};
use tracing::{debug, warn};

use crate::metrics::{AgentMetrics, DAY, HOUR, MINUTE, MetricsRegistry, MetricsSnapshot};

/// Longest single sleep inside [`RateLimiter::acquire`].
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Ceilings used when a caller names a class that is not configured.
const FALLBACK_LIMITS: ResourceLimits = ResourceLimits::new(30, 6_000, 500_000);

// ── Decisions ────────────────────────────────────────────────────────────

/// Why a call was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    GlobalCooldown,
    CallerCooldown,
    RequestsPerMinute,
    TokensPerMinute,
    TokensPerHour,
    TokensPerDay,
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GlobalCooldown => "global cooldown",
            Self::CallerCooldown => "caller cooldown",
            Self::RequestsPerMinute => "requests per minute",
            Self::TokensPerMinute => "tokens per minute",
            Self::TokensPerHour => "tokens per hour",
            Self::TokensPerDay => "tokens per day",
        };
        f.write_str(s)
    }
}

impl ThrottleReason {
    /// Whether the refusal comes from a rate-limit cooldown rather than an
    /// exhausted window.
    pub fn is_cooldown(&self) -> bool {
        matches!(self, Self::GlobalCooldown | Self::CallerCooldown)
    }
}

/// Outcome of a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    /// The call may proceed.
    Allowed,
    /// The call must wait at least `retry_after`.
    Throttled {
        reason: ThrottleReason,
        retry_after: Duration,
    },
}

impl LimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Budget could not be acquired within the queue wait ceiling.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{caller}: {reason} (waited {waited_ms}ms)")]
pub struct QueueTimeout {
    pub caller: String,
    pub reason: ThrottleReason,
    pub waited_ms: u64,
}

/// Global limiter state for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStatus {
    /// Rate-limit failures inside the current global span.
    pub recent_failures: usize,
    /// Remaining global cooldown, 0 when inactive.
    pub cooldown_remaining_ms: u64,
}

// ── RateLimiter ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GlobalState {
    failures: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

/// Per-caller call budget shared by every worker task.
pub struct RateLimiter {
    config: LimiterConfig,
    metrics: Arc<MetricsRegistry>,
    global: Mutex<GlobalState>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            config,
            metrics,
            global: Mutex::new(GlobalState::default()),
        }
    }

    /// The metrics registry this limiter writes to.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    fn limits(&self, class: &str) -> ResourceLimits {
        self.config
            .classes
            .get(class)
            .copied()
            .unwrap_or(FALLBACK_LIMITS)
    }

    /// Cooldown applied after a rate-limit failure at `priority`.
    pub fn cooldown_for(&self, priority: u8) -> Duration {
        let table = &self.config.priority_cooldowns_secs;
        let idx = usize::from(priority).min(table.len().saturating_sub(1));
        Duration::from_secs(table.get(idx).copied().unwrap_or(30))
    }

    /// Check whether `caller` may make a call now. Does not consume budget.
    pub fn check(&self, caller: &str, class: &str) -> LimitDecision {
        self.check_at(caller, class, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock.
    pub fn check_at(&self, caller: &str, class: &str, now: Instant) -> LimitDecision {
        if let Some(d) = self.global_gate(now) {
            return d;
        }
        let limits = self.limits(class);
        let handle = self.metrics.caller(caller);
        let mut m = handle.lock();
        self.evaluate(&mut m, &limits, now)
    }

    /// Check and, when allowed, count the call in one step.
    pub fn try_acquire_at(&self, caller: &str, class: &str, now: Instant) -> LimitDecision {
        if let Some(d) = self.global_gate(now) {
            return d;
        }
        let limits = self.limits(class);
        let handle = self.metrics.caller(caller);
        let mut m = handle.lock();
        let decision = self.evaluate(&mut m, &limits, now);
        if decision.is_allowed() {
            m.record_request(now);
        }
        decision
    }

    fn global_gate(&self, now: Instant) -> Option<LimitDecision> {
        let g = self.global.lock();
        g.cooldown_until
            .filter(|until| *until > now)
            .map(|until| LimitDecision::Throttled {
                reason: ThrottleReason::GlobalCooldown,
                retry_after: until - now,
            })
    }

    fn evaluate(&self, m: &mut AgentMetrics, limits: &ResourceLimits, now: Instant) -> LimitDecision {
        if let Some(remaining) = m.cooldown_remaining(now) {
            return LimitDecision::Throttled {
                reason: ThrottleReason::CallerCooldown,
                retry_after: remaining,
            };
        }

        if m.requests_last_minute(now) >= limits.rpm {
            return LimitDecision::Throttled {
                reason: ThrottleReason::RequestsPerMinute,
                retry_after: m.request_window_reset(now),
            };
        }

        let tpm_ceiling = (limits.tpm as f64 * self.config.tpm_block_ratio).round() as u64;
        if m.tokens_within(now, MINUTE) >= tpm_ceiling {
            return LimitDecision::Throttled {
                reason: ThrottleReason::TokensPerMinute,
                retry_after: m.token_window_reset(now, MINUTE),
            };
        }

        if let Some(tph) = limits.tph
            && m.tokens_within(now, HOUR) >= tph
        {
            return LimitDecision::Throttled {
                reason: ThrottleReason::TokensPerHour,
                retry_after: m.token_window_reset(now, HOUR),
            };
        }

        let tpd_ceiling = (limits.tpd as f64 * self.config.tpd_block_ratio).round() as u64;
        if m.tokens_within(now, DAY) >= tpd_ceiling {
            return LimitDecision::Throttled {
                reason: ThrottleReason::TokensPerDay,
                retry_after: m.token_window_reset(now, DAY),
            };
        }

        LimitDecision::Allowed
    }

    /// Wait until `caller` has budget, then count the call.
    ///
    /// Gives up with [`QueueTimeout`] once the configured queue wait has
    /// passed, or straight away when the required wait is longer than what
    /// is left of it.
    pub async fn acquire(&self, caller: &str, class: &str) -> Result<(), QueueTimeout> {
        let started = Instant::now();
        let ceiling = Duration::from_secs(self.config.max_queue_wait_secs);

        loop {
            let now = Instant::now();
            match self.try_acquire_at(caller, class, now) {
                LimitDecision::Allowed => return Ok(()),
                LimitDecision::Throttled {
                    reason,
                    retry_after,
                } => {
                    let waited = now.saturating_duration_since(started);
                    let left = ceiling.saturating_sub(waited);
                    if left.is_zero() || retry_after > left {
                        warn!(
                            caller,
                            reason = %reason,
                            waited_ms = waited.as_millis() as u64,
                            "limiter queue wait exceeded"
                        );
                        return Err(QueueTimeout {
                            caller: caller.to_string(),
                            reason,
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    debug!(caller, reason = %reason, "waiting for budget");
                    let nap = retry_after
                        .min(POLL_INTERVAL)
                        .max(Duration::from_millis(10));
                    tokio::time::sleep(nap).await;
                }
            }
        }
    }

    /// Count one call without checking.
    pub fn record_call(&self, caller: &str) {
        self.metrics.caller(caller).lock().record_request(Instant::now());
    }

    /// Count tokens consumed by a finished call.
    pub fn record_tokens(&self, caller: &str, tokens: u64) {
        self.metrics
            .caller(caller)
            .lock()
            .record_tokens(Instant::now(), tokens);
    }

    /// Register a rate-limit failure for `caller` at `priority`.
    pub fn record_failure(&self, caller: &str, priority: u8) {
        self.record_failure_at(caller, priority, Instant::now());
    }

    /// [`record_failure`](Self::record_failure) against an explicit clock.
    pub fn record_failure_at(&self, caller: &str, priority: u8, now: Instant) {
        let cooldown = self.cooldown_for(priority);
        self.metrics
            .caller(caller)
            .lock()
            .record_rate_limit(now, cooldown);
        warn!(
            caller,
            priority,
            cooldown_secs = cooldown.as_secs(),
            "rate-limit failure, caller cooling down"
        );

        let span = Duration::from_secs(self.config.global_span_secs);
        let mut g = self.global.lock();
        g.failures.push_back(now);
        while let Some(&ts) = g.failures.front() {
            if now.saturating_duration_since(ts) > span {
                g.failures.pop_front();
            } else {
                break;
            }
        }
        if g.failures.len() >= self.config.global_failure_threshold {
            let global = Duration::from_secs(self.config.global_cooldown_secs);
            g.cooldown_until = Some(now + global);
            g.failures.clear();
            warn!(
                cooldown_secs = global.as_secs(),
                "global rate-limit cooldown tripped"
            );
        }
    }

    /// Reset the caller's failure streak after a successful call.
    pub fn record_success(&self, caller: &str) {
        self.metrics.caller(caller).lock().record_success();
    }

    /// Whether `caller` is inside its own or the global cooldown.
    pub fn in_cooldown(&self, caller: &str) -> bool {
        let now = Instant::now();
        self.cooldown_remaining_at(caller, now).is_some()
    }

    /// The longer of the caller's and the global remaining cooldown.
    pub fn cooldown_remaining_at(&self, caller: &str, now: Instant) -> Option<Duration> {
        let global = {
            let g = self.global.lock();
            g.cooldown_until
                .filter(|until| *until > now)
                .map(|until| until - now)
        };
        let own = self.metrics.caller(caller).lock().cooldown_remaining(now);
        match (global, own) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Counters for one caller.
    pub fn status(&self, caller: &str) -> Option<MetricsSnapshot> {
        self.metrics.snapshot(caller)
    }

    pub fn global_status(&self) -> GlobalStatus {
        let now = Instant::now();
        let span = Duration::from_secs(self.config.global_span_secs);
        let g = self.global.lock();
        GlobalStatus {
            recent_failures: g
                .failures
                .iter()
                .filter(|ts| now.saturating_duration_since(**ts) <= span)
                .count(),
            cooldown_remaining_ms: g
                .cooldown_until
                .filter(|until| *until > now)
                .map(|until| (until - now).as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

// ── Credentials ──────────────────────────────────────────────────────────

/// Pick the credential index for a caller priority.
///
/// Priority 0 owns credential 0 outright. Every other priority is spread
/// over the remaining credentials; with a single credential everyone
/// shares it.
pub fn credential_index(priority: u8, credentials: usize) -> usize {
    if credentials <= 1 || priority == 0 {
        return 0;
    }
    1 + (usize::from(priority) - 1) % (credentials - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(class: ResourceLimits) -> RateLimiter {
        let mut config = LimiterConfig::default();
        config.classes.insert("test".into(), class);
        RateLimiter::new(config, Arc::new(MetricsRegistry::new()))
    }

    // --- Test 1: requests below the ceiling are allowed ---
    #[test]
    fn allows_under_rpm() {
        let rl = limiter_with(ResourceLimits::new(3, 10_000, 1_000_000));
        let now = Instant::now();
        for _ in 0..3 {
            assert!(rl.try_acquire_at("cipher", "test", now).is_allowed());
        }
    }

    // --- Test 2: the ceiling blocks and the window rotation unblocks ---
    #[test]
    fn blocks_at_rpm_and_unblocks_after_window() {
        let rl = limiter_with(ResourceLimits::new(2, 10_000, 1_000_000));
        let t0 = Instant::now();
        assert!(rl.try_acquire_at("cipher", "test", t0).is_allowed());
        assert!(rl.try_acquire_at("cipher", "test", t0).is_allowed());

        match rl.check_at("cipher", "test", t0 + Duration::from_secs(10)) {
            LimitDecision::Throttled {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, ThrottleReason::RequestsPerMinute);
                assert_eq!(retry_after, Duration::from_secs(50));
            }
            LimitDecision::Allowed => panic!("expected throttle at RPM ceiling"),
        }

        assert!(
            rl.check_at("cipher", "test", t0 + Duration::from_secs(61))
                .is_allowed()
        );
    }

    // --- Test 3: callers are independent ---
    #[test]
    fn callers_have_independent_windows() {
        let rl = limiter_with(ResourceLimits::new(1, 10_000, 1_000_000));
        let now = Instant::now();
        assert!(rl.try_acquire_at("cipher", "test", now).is_allowed());
        assert!(!rl.check_at("cipher", "test", now).is_allowed());
        assert!(rl.check_at("vita", "test", now).is_allowed());
    }

    // --- Test 4: TPM blocks at 90% of its ceiling ---
    #[test]
    fn tpm_blocks_at_ninety_percent() {
        let rl = limiter_with(ResourceLimits::new(100, 1_000, 1_000_000));
        rl.record_tokens("oracle", 899);
        assert!(rl.check("oracle", "test").is_allowed());
        rl.record_tokens("oracle", 1);
        match rl.check("oracle", "test") {
            LimitDecision::Throttled { reason, .. } => {
                assert_eq!(reason, ThrottleReason::TokensPerMinute)
            }
            LimitDecision::Allowed => panic!("expected TPM throttle"),
        }
    }

    // --- Test 5: TPD blocks at 95% of its ceiling ---
    #[test]
    fn tpd_blocks_at_ninety_five_percent() {
        let rl = limiter_with(ResourceLimits::new(100, 1_000_000, 10_000));
        rl.record_tokens("oracle", 9_500);
        match rl.check("oracle", "test") {
            LimitDecision::Throttled { reason, .. } => {
                assert_eq!(reason, ThrottleReason::TokensPerDay)
            }
            LimitDecision::Allowed => panic!("expected TPD throttle"),
        }
    }

    // --- Test 6: hourly ceiling only applies when configured ---
    #[test]
    fn tph_applies_when_set() {
        let mut limits = ResourceLimits::new(100, 1_000_000, 1_000_000);
        limits.tph = Some(500);
        let rl = limiter_with(limits);
        rl.record_tokens("memex", 500);
        assert!(matches!(
            rl.check("memex", "test"),
            LimitDecision::Throttled {
                reason: ThrottleReason::TokensPerHour,
                ..
            }
        ));
    }

    // --- Test 7: priority table drives the caller cooldown ---
    #[test]
    fn priority_cooldowns() {
        let rl = limiter_with(ResourceLimits::new(10, 10_000, 1_000_000));
        assert_eq!(rl.cooldown_for(0), Duration::from_secs(2));
        assert_eq!(rl.cooldown_for(3), Duration::from_secs(15));
        assert_eq!(rl.cooldown_for(5), Duration::from_secs(30));
        assert_eq!(rl.cooldown_for(9), Duration::from_secs(30));

        let t0 = Instant::now();
        rl.record_failure_at("spark", 1, t0);
        match rl.check_at("spark", "test", t0 + Duration::from_secs(1)) {
            LimitDecision::Throttled {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, ThrottleReason::CallerCooldown);
                assert_eq!(retry_after, Duration::from_secs(4));
            }
            LimitDecision::Allowed => panic!("expected caller cooldown"),
        }
        assert!(
            rl.check_at("spark", "test", t0 + Duration::from_secs(5))
                .is_allowed()
        );
    }

    // --- Test 8: five failures in the span trip the global cooldown ---
    #[test]
    fn global_cooldown_after_five_failures() {
        let rl = limiter_with(ResourceLimits::new(10, 10_000, 1_000_000));
        let t0 = Instant::now();
        for (i, caller) in ["a", "b", "c", "d"].iter().enumerate() {
            rl.record_failure_at(caller, 0, t0 + Duration::from_secs(i as u64));
        }
        assert!(rl.check_at("z", "test", t0 + Duration::from_secs(5)).is_allowed());

        rl.record_failure_at("e", 0, t0 + Duration::from_secs(5));
        match rl.check_at("z", "test", t0 + Duration::from_secs(6)) {
            LimitDecision::Throttled {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, ThrottleReason::GlobalCooldown);
                assert_eq!(retry_after, Duration::from_secs(59));
            }
            LimitDecision::Allowed => panic!("expected global cooldown"),
        }
        assert!(
            rl.check_at("z", "test", t0 + Duration::from_secs(66))
                .is_allowed()
        );
    }

    // --- Test 9: failures outside the span do not accumulate ---
    #[test]
    fn spread_out_failures_do_not_trip_global() {
        let rl = limiter_with(ResourceLimits::new(10, 10_000, 1_000_000));
        let t0 = Instant::now();
        for i in 0..5u64 {
            rl.record_failure_at("a", 0, t0 + Duration::from_secs(i * 20));
        }
        assert_eq!(rl.global_status().cooldown_remaining_ms, 0);
    }

    // --- Test 10: success resets the streak but not the cooldown ---
    #[test]
    fn success_resets_failure_streak() {
        let rl = limiter_with(ResourceLimits::new(10, 10_000, 1_000_000));
        rl.record_failure("vita", 4);
        rl.record_failure("vita", 4);
        assert_eq!(rl.status("vita").unwrap().consecutive_failures, 2);
        rl.record_success("vita");
        let snap = rl.status("vita").unwrap();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.rate_limit_hits, 2);
        assert!(rl.in_cooldown("vita"));
    }

    // --- Test 11: unknown classes fall back to conservative ceilings ---
    #[test]
    fn unknown_class_uses_fallback() {
        let rl = limiter_with(ResourceLimits::new(10, 10_000, 1_000_000));
        let now = Instant::now();
        for _ in 0..30 {
            assert!(rl.try_acquire_at("x", "nope", now).is_allowed());
        }
        assert!(!rl.check_at("x", "nope", now).is_allowed());
    }

    // --- Test 12: acquire gives up when the wait exceeds the ceiling ---
    #[tokio::test]
    async fn acquire_times_out_when_wait_too_long() {
        let mut config = LimiterConfig::default();
        config.max_queue_wait_secs = 1;
        config
            .classes
            .insert("test".into(), ResourceLimits::new(1, 10_000, 1_000_000));
        let rl = RateLimiter::new(config, Arc::new(MetricsRegistry::new()));

        rl.acquire("cipher", "test").await.unwrap();
        let err = rl.acquire("cipher", "test").await.unwrap_err();
        assert_eq!(err.reason, ThrottleReason::RequestsPerMinute);
        assert_eq!(err.caller, "cipher");
    }

    // --- Test 13: acquire waits out a short cooldown ---
    #[tokio::test]
    async fn acquire_waits_out_short_cooldown() {
        let mut config = LimiterConfig::default();
        config.max_queue_wait_secs = 5;
        config.priority_cooldowns_secs = vec![1];
        let rl = RateLimiter::new(config, Arc::new(MetricsRegistry::new()));

        rl.record_failure("echo", 0);
        let started = Instant::now();
        rl.acquire("echo", "default").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(rl.status("echo").unwrap().total_requests, 1);
    }

    // --- Test 14: credential assignment ---
    #[test]
    fn credential_assignment() {
        assert_eq!(credential_index(0, 1), 0);
        assert_eq!(credential_index(3, 1), 0);
        assert_eq!(credential_index(0, 3), 0);
        assert_eq!(credential_index(1, 3), 1);
        assert_eq!(credential_index(2, 3), 2);
        assert_eq!(credential_index(3, 3), 1);
        assert_eq!(credential_index(5, 2), 1);
    }
}
