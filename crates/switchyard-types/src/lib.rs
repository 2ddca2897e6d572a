//! Core types for the switchyard query-dispatch hub.
//!
//! Shared by every crate in the workspace:
//!
//! - [`error`] -- [`SwitchyardError`] and the crate-wide [`Result`] alias
//! - [`config`] -- configuration schema, discovery and the built-in roster
//! - [`request`] -- the immutable caller [`Request`]
//! - [`payload`] -- per-worker [`Payload`] results
//! - [`routing`] -- [`RoutingDecision`] produced by the router

pub mod config;
pub mod error;
pub mod payload;
pub mod request;
pub mod routing;

pub use config::Config;
pub use error::{Result, SwitchyardError};
pub use payload::{Payload, PayloadKind, PayloadMeta, PayloadStatus};
pub use request::Request;
pub use routing::{RoutingDecision, RoutingMethod, ScoredWorker};
