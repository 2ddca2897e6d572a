//! Pipeline progress events.
//!
//! The engine publishes [`PipelineEvent`]s on a bounded
//! `tokio::sync::mpsc` channel that the caller drains on its own schedule.
//! Publishing uses `try_send`: a full or closed channel drops the event
//! and never stalls the pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use switchyard_types::{PayloadStatus, RoutingMethod};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Outcome of one task in the task pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Repaired,
    Failed,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    Blocked { reason: String },
    FastPath,
    Enriched { fragments: usize },
    StageSkipped { stage: String },
    Routed { workers: Vec<String>, method: RoutingMethod },
    WorkerFinished { worker: String, status: PayloadStatus, elapsed_ms: u64 },
    Redacted { worker: String, warnings: usize },
    RunFinished { payloads: usize, elapsed_ms: u64 },
    TaskStarted { index: usize, total: usize, input: String },
    TaskFinished { index: usize, status: TaskStatus },
    TaskFailed { index: usize, error: String },
    RepairStarted { rate_limited: bool },
    RepairFinished { recovered: bool, analysis: String },
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineEvent {
    pub at: DateTime<Utc>,
    /// Correlation id of the run; empty for task-level events.
    pub trace_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl PipelineEvent {
    pub fn new(trace_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            at: Utc::now(),
            trace_id: trace_id.into(),
            kind,
        }
    }
}

/// Sending half handed to the pipeline. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl EventSink {
    /// A sink that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// A sink and the receiver the caller drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn emit(&self, trace_id: &str, kind: EventKind) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(PipelineEvent::new(trace_id, kind)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("event channel full, dropping event"),
            Err(TrySendError::Closed(_)) => debug!("event receiver gone, dropping event"),
        }
    }
}
