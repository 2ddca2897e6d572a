//! Failure repair.
//!
//! [`RepairLoop::handle_failure`] gets one shot at turning a failed task
//! into a success:
//!
//! - **Rate limit**: sleep for the responsible cooldown (capped), give up if
//!   the limiter's global cooldown is still running, otherwise rerun the
//!   same input once.
//! - **Anything else**: ask the [`Planner`] for a revised input, rerun once,
//!   and when the task declares an expectation, verify the new result
//!   before accepting it.
//!
//! Reruns go through a [`PipelineRunner`], which the engine implements with
//! the duplicate guard disabled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use switchyard_types::config::RepairConfig;
use switchyard_types::{Payload, PayloadStatus, SwitchyardError};
use tracing::{info, warn};

use crate::collaborators::{Planner, RepairPlan, Task};
use crate::limiter::RateLimiter;

/// Reruns the pipeline on behalf of the repair loop.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn rerun(&self, text: &str) -> Result<Vec<Payload>, SwitchyardError>;
}

/// Result of one repair attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RepairOutcome {
    pub recovered: bool,
    pub payloads: Vec<Payload>,
    pub plan: Option<RepairPlan>,
    pub analysis: String,
}

impl RepairOutcome {
    fn failed(analysis: impl Into<String>, plan: Option<RepairPlan>, payloads: Vec<Payload>) -> Self {
        Self {
            recovered: false,
            payloads,
            plan,
            analysis: analysis.into(),
        }
    }
}

/// The error a payload list represents, if every payload failed.
///
/// A rate-limited payload maps to a rate-limit error so the repair loop
/// takes the cooldown path.
pub fn failure_of(payloads: &[Payload]) -> Option<SwitchyardError> {
    if payloads.is_empty() || payloads.iter().any(|p| !p.is_error()) {
        return None;
    }
    if let Some(p) = payloads
        .iter()
        .find(|p| p.meta.status == PayloadStatus::RateLimited)
    {
        return Some(SwitchyardError::Worker {
            worker: p.worker().to_string(),
            message: format!("rate limited: {}", p.display()),
        });
    }
    if let Some(p) = payloads
        .iter()
        .find(|p| p.meta.status == PayloadStatus::Blocked)
    {
        return Some(SwitchyardError::SafetyBlocked {
            reason: p.display().to_string(),
        });
    }
    let message = payloads
        .iter()
        .map(|p| format!("{}: {}", p.worker(), p.display()))
        .collect::<Vec<_>>()
        .join("; ");
    Some(SwitchyardError::Worker {
        worker: payloads[0].worker().to_string(),
        message,
    })
}

/// One-shot repair of failed tasks.
pub struct RepairLoop {
    config: RepairConfig,
    planner: Arc<dyn Planner>,
    limiter: Arc<RateLimiter>,
}

impl RepairLoop {
    pub fn new(config: RepairConfig, planner: Arc<dyn Planner>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            config,
            planner,
            limiter,
        }
    }

    pub fn planner(&self) -> &Arc<dyn Planner> {
        &self.planner
    }

    /// How long to back off before retrying after `error`.
    ///
    /// The longest of the error's own retry hint, the responsible worker's
    /// (or otherwise the global) limiter cooldown, and the shortest
    /// priority cooldown; capped at the configured maximum backoff.
    pub fn backoff_for(&self, error: &SwitchyardError) -> Duration {
        let now = Instant::now();
        let hinted = match error {
            SwitchyardError::RateLimited { retry_after_ms } => Duration::from_millis(*retry_after_ms),
            _ => Duration::ZERO,
        };
        let limiter = match error {
            SwitchyardError::Worker { worker, .. } => self.limiter.cooldown_remaining_at(worker, now),
            _ => Some(Duration::from_millis(self.limiter.global_status().cooldown_remaining_ms)),
        }
        .unwrap_or_default();
        let floor = self.limiter.cooldown_for(0);
        hinted
            .max(limiter)
            .max(floor)
            .min(Duration::from_secs(self.config.max_backoff_secs))
    }

    /// Try once to recover `task` from `error`.
    pub async fn handle_failure(
        &self,
        error: &SwitchyardError,
        task: &Task,
        runner: &dyn PipelineRunner,
    ) -> RepairOutcome {
        if matches!(error, SwitchyardError::SafetyBlocked { .. }) {
            return RepairOutcome::failed("blocked requests are never retried", None, Vec::new());
        }
        if error.is_rate_limit() {
            return self.retry_after_cooldown(error, task, runner).await;
        }
        self.revise_and_rerun(error, task, runner).await
    }

    async fn retry_after_cooldown(
        &self,
        error: &SwitchyardError,
        task: &Task,
        runner: &dyn PipelineRunner,
    ) -> RepairOutcome {
        let backoff = self.backoff_for(error);
        info!(backoff_ms = backoff.as_millis() as u64, "rate limited, backing off before retry");
        tokio::time::sleep(backoff).await;

        if self.limiter.global_status().cooldown_remaining_ms > 0 {
            warn!("provider still cooling down after backoff");
            return RepairOutcome::failed("rate limit: provider unavailable after cooldown", None, Vec::new());
        }

        let plan = RepairPlan {
            revised_input: task.input.clone(),
            analysis: "rate limit".into(),
            strategy: "cooldown + retry".into(),
        };
        match runner.rerun(&task.input).await {
            Ok(payloads) => match failure_of(&payloads) {
                None => RepairOutcome {
                    recovered: true,
                    payloads,
                    plan: Some(plan),
                    analysis: "rate limit retry".into(),
                },
                Some(e) => RepairOutcome::failed(format!("rate limit: retry failed ({e})"), Some(plan), payloads),
            },
            Err(e) => RepairOutcome::failed(format!("rate limit: retry failed ({e})"), Some(plan), Vec::new()),
        }
    }

    async fn revise_and_rerun(
        &self,
        error: &SwitchyardError,
        task: &Task,
        runner: &dyn PipelineRunner,
    ) -> RepairOutcome {
        let Some(plan) = self.planner.revise(&error.to_string(), task).await else {
            warn!("planner produced no repair plan");
            return RepairOutcome::failed("no repair plan", None, Vec::new());
        };
        info!(strategy = %plan.strategy, "rerunning with revised input");

        let payloads = match runner.rerun(&plan.revised_input).await {
            Ok(payloads) => payloads,
            Err(e) => return RepairOutcome::failed(format!("rerun failed: {e}"), Some(plan), Vec::new()),
        };
        if let Some(e) = failure_of(&payloads) {
            return RepairOutcome::failed(format!("rerun failed: {e}"), Some(plan), payloads);
        }

        let mut analysis = String::new();
        if task.expectation().is_some() {
            let verdict = self.planner.verify(task, &payloads).await;
            analysis = verdict.analysis;
            if !verdict.matched {
                warn!(analysis = %analysis, "repaired result failed verification");
                return RepairOutcome::failed(analysis, Some(plan), payloads);
            }
        }
        RepairOutcome {
            recovered: true,
            payloads,
            plan: Some(plan),
            analysis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Verification;
    use crate::metrics::MetricsRegistry;
    use parking_lot::Mutex;
    use switchyard_types::config::LimiterConfig;

    struct FakePlanner {
        plan: Option<&'static str>,
        verdict: bool,
    }

    #[async_trait]
    impl Planner for FakePlanner {
        async fn revise(&self, _error: &str, _task: &Task) -> Option<RepairPlan> {
            self.plan.map(|input| RepairPlan {
                revised_input: input.into(),
                analysis: String::new(),
                strategy: "rephrase".into(),
            })
        }

        async fn verify(&self, _task: &Task, _payloads: &[Payload]) -> Verification {
            Verification {
                matched: self.verdict,
                analysis: if self.verdict { "ok".into() } else { "still wrong".into() },
            }
        }
    }

    struct Recorder {
        inputs: Mutex<Vec<String>>,
        result: fn() -> Result<Vec<Payload>, SwitchyardError>,
    }

    #[async_trait]
    impl PipelineRunner for Recorder {
        async fn rerun(&self, text: &str) -> Result<Vec<Payload>, SwitchyardError> {
            self.inputs.lock().push(text.to_string());
            (self.result)()
        }
    }

    fn answers() -> Result<Vec<Payload>, SwitchyardError> {
        Ok(vec![Payload::text("oracle", "answer")])
    }

    fn failures() -> Result<Vec<Payload>, SwitchyardError> {
        Ok(vec![Payload::error("oracle", PayloadStatus::Failed, "boom")])
    }

    fn recorder(result: fn() -> Result<Vec<Payload>, SwitchyardError>) -> Recorder {
        Recorder {
            inputs: Mutex::new(Vec::new()),
            result,
        }
    }

    fn repair(plan: Option<&'static str>, verdict: bool) -> (RepairLoop, Arc<RateLimiter>) {
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig::default(),
            Arc::new(MetricsRegistry::new()),
        ));
        let config = RepairConfig {
            enabled: true,
            max_backoff_secs: 0,
        };
        let lp = RepairLoop::new(config, Arc::new(FakePlanner { plan, verdict }), limiter.clone());
        (lp, limiter)
    }

    fn worker_error() -> SwitchyardError {
        SwitchyardError::Worker {
            worker: "oracle".into(),
            message: "boom".into(),
        }
    }

    #[test]
    fn failure_of_requires_all_errors() {
        assert!(failure_of(&[]).is_none());
        let mixed = vec![
            Payload::text("a", "fine"),
            Payload::error("b", PayloadStatus::Failed, "x"),
        ];
        assert!(failure_of(&mixed).is_none());
        let limited = vec![Payload::error("b", PayloadStatus::RateLimited, "rate limited: retry after 5ms")];
        assert!(failure_of(&limited).unwrap().is_rate_limit());
        let blocked = vec![Payload::error("admission", PayloadStatus::Blocked, "BLOCKED")];
        assert!(matches!(failure_of(&blocked), Some(SwitchyardError::SafetyBlocked { .. })));
    }

    #[tokio::test]
    async fn revised_rerun_recovers() {
        let (lp, _) = repair(Some("simpler question"), true);
        let runner = recorder(answers);
        let task = Task::new("hard question").with_expectation("an answer");
        let out = lp.handle_failure(&worker_error(), &task, &runner).await;
        assert!(out.recovered);
        assert_eq!(out.analysis, "ok");
        assert_eq!(out.plan.unwrap().revised_input, "simpler question");
        assert_eq!(*runner.inputs.lock(), vec!["simpler question".to_string()]);
    }

    #[tokio::test]
    async fn failed_verification_not_recovered() {
        let (lp, _) = repair(Some("again"), false);
        let task = Task::new("q").with_expectation("e");
        let out = lp.handle_failure(&worker_error(), &task, &recorder(answers)).await;
        assert!(!out.recovered);
        assert_eq!(out.analysis, "still wrong");
        assert_eq!(out.payloads.len(), 1);
    }

    #[tokio::test]
    async fn no_expectation_skips_verification() {
        let (lp, _) = repair(Some("again"), false);
        let out = lp.handle_failure(&worker_error(), &Task::new("q"), &recorder(answers)).await;
        assert!(out.recovered);
    }

    #[tokio::test]
    async fn no_plan_no_rerun() {
        let (lp, _) = repair(None, true);
        let runner = recorder(answers);
        let out = lp.handle_failure(&worker_error(), &Task::new("q"), &runner).await;
        assert!(!out.recovered);
        assert_eq!(out.analysis, "no repair plan");
        assert!(runner.inputs.lock().is_empty());
    }

    #[tokio::test]
    async fn failing_rerun_not_recovered() {
        let (lp, _) = repair(Some("again"), true);
        let out = lp.handle_failure(&worker_error(), &Task::new("q"), &recorder(failures)).await;
        assert!(!out.recovered);
        assert!(out.analysis.starts_with("rerun failed"));
    }

    #[tokio::test]
    async fn rate_limit_reruns_same_input() {
        let (lp, _) = repair(None, true);
        let runner = recorder(answers);
        let error = SwitchyardError::RateLimited { retry_after_ms: 10 };
        let out = lp.handle_failure(&error, &Task::new("original"), &runner).await;
        assert!(out.recovered);
        assert_eq!(out.analysis, "rate limit retry");
        assert_eq!(*runner.inputs.lock(), vec!["original".to_string()]);
    }

    #[tokio::test]
    async fn rate_limit_gives_up_during_global_cooldown() {
        let (lp, limiter) = repair(None, true);
        for _ in 0..5 {
            limiter.record_failure("cipher", 2);
        }
        let runner = recorder(answers);
        let error = SwitchyardError::RateLimited { retry_after_ms: 10 };
        let out = lp.handle_failure(&error, &Task::new("q"), &runner).await;
        assert!(!out.recovered);
        assert!(runner.inputs.lock().is_empty());
    }

    #[tokio::test]
    async fn safety_block_never_retried() {
        let (lp, _) = repair(Some("x"), true);
        let runner = recorder(answers);
        let error = SwitchyardError::SafetyBlocked { reason: "injection".into() };
        let out = lp.handle_failure(&error, &Task::new("q"), &runner).await;
        assert!(!out.recovered);
        assert!(runner.inputs.lock().is_empty());
    }

    #[test]
    fn backoff_capped_and_uses_worker_cooldown() {
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig::default(),
            Arc::new(MetricsRegistry::new()),
        ));
        let config = RepairConfig {
            enabled: true,
            max_backoff_secs: 65,
        };
        let lp = RepairLoop::new(config, Arc::new(FakePlanner { plan: None, verdict: true }), limiter.clone());
        limiter.record_failure("cipher", 5);
        let error = SwitchyardError::Worker {
            worker: "cipher".into(),
            message: "429".into(),
        };
        let backoff = lp.backoff_for(&error);
        assert!(backoff > Duration::from_secs(25) && backoff <= Duration::from_secs(30));

        let hinted = SwitchyardError::RateLimited { retry_after_ms: 600_000 };
        assert_eq!(lp.backoff_for(&hinted), Duration::from_secs(65));
    }

    #[test]
    fn queued_cooldown_backs_off_for_global_cooldown() {
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig::default(),
            Arc::new(MetricsRegistry::new()),
        ));
        for _ in 0..5 {
            limiter.record_failure("upstream", 0);
        }
        let lp = RepairLoop::new(
            RepairConfig {
                enabled: true,
                max_backoff_secs: 65,
            },
            Arc::new(FakePlanner { plan: None, verdict: true }),
            limiter,
        );
        let queued = vec![Payload::error(
            "oracle",
            PayloadStatus::RateLimited,
            "rate limited while queued: oracle: global cooldown (waited 0ms)",
        )];
        let error = failure_of(&queued).unwrap();
        assert!(error.is_rate_limit());
        let backoff = lp.backoff_for(&error);
        assert!(backoff > Duration::from_secs(55) && backoff <= Duration::from_secs(60));
    }
}
