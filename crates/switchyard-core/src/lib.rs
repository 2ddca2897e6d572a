//! # switchyard-core
//!
//! Dispatch pipeline for the switchyard query-dispatch hub.
//!
//! Contains the admission gate, semantic router, parallel worker
//! dispatcher with circuit breakers, the rate limiter and response cache,
//! the self-tuning stage instrumentation, the output validator and the
//! repair loop, all wired together by [`Engine`].

pub mod admission;
pub mod cache;
pub mod circuit;
pub mod collaborators;
pub mod dispatch;
pub mod embeddings;
pub mod engine;
pub mod events;
pub mod limiter;
pub mod metrics;
pub mod repair;
pub mod router;
pub mod tuner;
pub mod validator;
pub mod worker;

pub use engine::{Engine, EngineBuilder, EngineStatus, PipelineError, TaskResult};
pub use events::{EventKind, EventSink, PipelineEvent, TaskStatus};
pub use collaborators::Task;
