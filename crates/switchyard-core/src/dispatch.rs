//! Parallel worker dispatch.
//!
//! [`WorkerDispatcher::dispatch`] spawns one tokio task per routed worker
//! and joins them in routed order, so the result always has the same
//! length and order as the input. Each task is wrapped, in this order, by:
//!
//! 1. the worker's circuit breaker: an open circuit yields a synthesized
//!    payload and the worker is never invoked;
//! 2. the rate limiter: the task waits for budget up to the queue ceiling;
//! 3. the worker's own timeout: a late invocation is dropped;
//! 4. bookkeeping: timing and outcome go to the caller's metrics and the
//!    dispatch stage statistics.
//!
//! Failures and timeouts count towards the circuit. Rate-limit failures go
//! to the limiter instead. A queue wait that gives up because of a cooldown
//! is reported as rate-limited, one that gives up on an exhausted window as
//! timed out. A panicking worker task becomes an error payload.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use switchyard_types::{Payload, PayloadStatus};
use tracing::{debug, warn};

use crate::circuit::CircuitBreakers;
use crate::events::{EventKind, EventSink};
use crate::limiter::RateLimiter;
use crate::tuner::{PipelineStage, PipelineTuner};
use crate::worker::{WorkerError, WorkerRegistry};

/// Runs routed workers concurrently under isolation.
#[derive(Clone)]
pub struct WorkerDispatcher {
    registry: Arc<WorkerRegistry>,
    breakers: Arc<CircuitBreakers>,
    limiter: Arc<RateLimiter>,
    tuner: Option<Arc<PipelineTuner>>,
}

impl WorkerDispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        breakers: Arc<CircuitBreakers>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            registry,
            breakers,
            limiter,
            tuner: None,
        }
    }

    /// Record every invocation into `tuner`'s dispatch stage.
    pub fn with_tuner(mut self, tuner: Arc<PipelineTuner>) -> Self {
        self.tuner = Some(tuner);
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Invoke `worker_ids` on `text` in parallel. One payload per id, in
    /// the same order.
    pub async fn dispatch(
        &self,
        worker_ids: &[String],
        text: &str,
        trace_id: &str,
        events: &EventSink,
    ) -> Vec<Payload> {
        let handles: Vec<_> = worker_ids
            .iter()
            .map(|id| {
                let this = self.clone();
                let id = id.clone();
                let text = text.to_string();
                let trace_id = trace_id.to_string();
                tokio::spawn(async move { this.run_one(&id, &text, &trace_id).await })
            })
            .collect();

        let joined = join_all(handles).await;

        worker_ids
            .iter()
            .zip(joined)
            .map(|(id, result)| {
                let payload = match result {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(worker = %id, error = %e, "worker task aborted");
                        self.breakers.record_failure(id);
                        Payload::error(id, PayloadStatus::Failed, format!("worker task aborted: {e}"))
                            .with_trace_id(trace_id)
                    }
                };
                events.emit(
                    trace_id,
                    EventKind::WorkerFinished {
                        worker: id.clone(),
                        status: payload.meta.status,
                        elapsed_ms: payload.meta.elapsed_ms,
                    },
                );
                payload
            })
            .collect()
    }

    async fn run_one(&self, id: &str, text: &str, trace_id: &str) -> Payload {
        if !self.breakers.may_invoke(id) {
            debug!(worker = id, "circuit open, not invoking");
            return Payload::error(
                id,
                PayloadStatus::CircuitOpen,
                format!("{id} is temporarily unavailable (circuit open)"),
            )
            .with_trace_id(trace_id);
        }

        let Some(worker) = self.registry.get(id) else {
            warn!(worker = id, "routed to unregistered worker");
            return Payload::error(id, PayloadStatus::Failed, WorkerError::NotFound(id.into()).to_string())
                .with_trace_id(trace_id);
        };
        let settings = self.registry.settings(id);

        let queued = Instant::now();
        if let Err(e) = self.limiter.acquire(id, &settings.resource_class).await {
            // Cooling down is the provider's throttling seen ahead of time.
            let mut payload = if e.reason.is_cooldown() {
                Payload::error(id, PayloadStatus::RateLimited, format!("rate limited while queued: {e}"))
            } else {
                Payload::error(
                    id,
                    PayloadStatus::TimedOut,
                    format!("no call budget within the queue limit: {e}"),
                )
            }
            .with_trace_id(trace_id);
            payload.meta.elapsed_ms = queued.elapsed().as_millis() as u64;
            return payload;
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(settings.timeout, worker.invoke(text)).await;
        let elapsed = started.elapsed();

        let mut payload = match outcome {
            Ok(Ok(payload)) => {
                self.breakers.record_success(id);
                self.limiter.record_success(id);
                self.limiter.record_tokens(id, payload.meta.tokens);
                payload
            }
            Ok(Err(e)) if e.is_rate_limit() => {
                self.limiter.record_failure(id, settings.priority);
                Payload::error(id, PayloadStatus::RateLimited, e.to_string())
            }
            Ok(Err(e)) => {
                warn!(worker = id, error = %e, "worker failed");
                self.breakers.record_failure(id);
                Payload::error(id, PayloadStatus::Failed, e.to_string())
            }
            Err(_) => {
                warn!(worker = id, timeout_ms = settings.timeout.as_millis() as u64, "worker timed out");
                self.breakers.record_failure(id);
                Payload::error(
                    id,
                    PayloadStatus::TimedOut,
                    format!("{id} did not answer within {}s", settings.timeout.as_secs()),
                )
            }
        };

        let ok = !payload.is_error();
        self.record(id, elapsed, ok);
        payload.meta.elapsed_ms = elapsed.as_millis() as u64;
        payload.meta.trace_id = trace_id.to_string();
        payload
    }

    fn record(&self, id: &str, elapsed: Duration, ok: bool) {
        self.limiter
            .metrics()
            .caller(id)
            .lock()
            .record_invocation(elapsed, ok);
        if let Some(tuner) = &self.tuner {
            tuner.record(PipelineStage::Dispatch, elapsed, usize::from(ok));
        }
    }
}
