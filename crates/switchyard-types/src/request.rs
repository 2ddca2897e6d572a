//! Incoming caller requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single caller request as it enters the hub.
///
/// Immutable once created: the text, correlation id and arrival stamp are
/// fixed for the lifetime of the pipeline run. Retries issued by the repair
/// loop build a fresh `Request` carrying the revised text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    text: String,
    id: Uuid,
    received_at: DateTime<Utc>,
}

impl Request {
    /// Create a request with a fresh correlation id stamped now.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            id: Uuid::new_v4(),
            received_at: Utc::now(),
        }
    }

    /// The caller's text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Correlation id carried through every payload as `trace_id`.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wall-clock arrival time.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Short form of the correlation id used in log lines.
    pub fn trace_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}
