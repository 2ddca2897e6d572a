//! Dispatch results returned to callers.
//!
//! A [`Payload`] is produced for every routed worker, whether the worker
//! succeeded, failed, timed out or was skipped by an open circuit. Only the
//! display string may change after construction; the output validator
//! rewrites it in place when it redacts content.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The shape of a payload's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Free text.
    Text,
    /// Structured JSON (for example extracted code artifacts).
    Structured,
    /// A synthesized error.
    Error,
}

/// Outcome recorded in a payload's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadStatus {
    /// The worker returned normally.
    Ok,
    /// The worker returned an error.
    Failed,
    /// The worker did not finish before its deadline.
    TimedOut,
    /// The worker's circuit was open; it was not invoked.
    CircuitOpen,
    /// The caller budget could not be acquired in time.
    RateLimited,
    /// The admission gate refused the request.
    Blocked,
    /// Answered by the fast path without routing.
    FastPath,
}

/// Per-payload metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMeta {
    /// How the invocation ended.
    pub status: PayloadStatus,

    /// Wall time spent on this worker, in milliseconds.
    #[serde(default)]
    pub elapsed_ms: u64,

    /// Whether the answer came from the response cache.
    #[serde(default)]
    pub cache_hit: bool,

    /// Correlation id of the originating request.
    #[serde(default)]
    pub trace_id: String,

    /// Tokens consumed by the invocation, when known.
    #[serde(default)]
    pub tokens: u64,

    /// Free-form extras (for example the redaction warning count).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PayloadMeta {
    /// Metadata with the given status and everything else zeroed.
    pub fn new(status: PayloadStatus) -> Self {
        Self {
            status,
            elapsed_ms: 0,
            cache_hit: false,
            trace_id: String::new(),
            tokens: 0,
            extra: BTreeMap::new(),
        }
    }
}

/// One worker's contribution to a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    worker: String,
    kind: PayloadKind,
    content: serde_json::Value,
    display: String,
    /// Timing, status and trace metadata.
    pub meta: PayloadMeta,
}

impl Payload {
    /// A successful text payload.
    pub fn text(worker: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            worker: worker.into(),
            kind: PayloadKind::Text,
            content: serde_json::Value::String(text.clone()),
            display: text,
            meta: PayloadMeta::new(PayloadStatus::Ok),
        }
    }

    /// A successful structured payload with a human-readable rendering.
    pub fn structured(
        worker: impl Into<String>,
        content: serde_json::Value,
        display: impl Into<String>,
    ) -> Self {
        Self {
            worker: worker.into(),
            kind: PayloadKind::Structured,
            content,
            display: display.into(),
            meta: PayloadMeta::new(PayloadStatus::Ok),
        }
    }

    /// A synthesized error payload.
    pub fn error(
        worker: impl Into<String>,
        status: PayloadStatus,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            worker: worker.into(),
            kind: PayloadKind::Error,
            content: serde_json::json!({ "error": message }),
            display: message,
            meta: PayloadMeta::new(status),
        }
    }

    /// Set the status, keeping the rest of the metadata.
    pub fn with_status(mut self, status: PayloadStatus) -> Self {
        self.meta.status = status;
        self
    }

    /// Attach the correlation id.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.meta.trace_id = trace_id.into();
        self
    }

    /// Id of the worker that produced this payload.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Content shape.
    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    /// Raw content as produced by the worker.
    pub fn content(&self) -> &serde_json::Value {
        &self.content
    }

    /// The string shown to the caller.
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Replace the display string. Content is left untouched.
    pub fn set_display(&mut self, display: String) {
        self.display = display;
    }

    /// Whether this payload is a synthesized error.
    pub fn is_error(&self) -> bool {
        self.kind == PayloadKind::Error
    }
}
