//! CLI command implementations for `switchyard`.
//!
//! - [`run`] -- Single request through the pipeline.
//! - [`tasks`] -- Task list with verification and repair.
//! - [`route`] -- Routing decision only.
//! - [`status`] -- Configuration and resilience state.
//! - [`config_cmd`] -- Resolved configuration dump.

pub mod config_cmd;
pub mod route;
pub mod run;
pub mod status;
pub mod tasks;

use std::path::Path;

use switchyard_core::Engine;
use switchyard_types::Config;
use switchyard_types::Payload;
use tracing::{debug, info};

/// Load configuration from the given path override or via auto-discovery
/// (`SWITCHYARD_CONFIG`, then `~/.switchyard/config.json`, else defaults).
pub fn load_config(config_override: Option<&str>) -> anyhow::Result<Config> {
    match config_override {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!("config file not found: {path_str}");
            }
            debug!(path = %path.display(), "loading config override");
            switchyard_types::config::load_config_from(path)
                .map_err(|e| anyhow::anyhow!("failed to load config: {e}"))
        }
        None => switchyard_types::config::load_config()
            .map_err(|e| anyhow::anyhow!("failed to load config: {e}")),
    }
}

/// Build the engine for `config`.
pub async fn build_engine(config: Config) -> anyhow::Result<Engine> {
    let engine = Engine::from_config(config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start engine: {e}"))?;
    info!(workers = engine.status().workers.len(), "engine started");
    Ok(engine)
}

/// Human-readable block for one payload.
pub fn render_payload(payload: &Payload) -> String {
    format!(
        "── {} [{:?}, {}ms{}] ──\n{}",
        payload.worker(),
        payload.meta.status,
        payload.meta.elapsed_ms,
        if payload.meta.cache_hit { ", cached" } else { "" },
        payload.display()
    )
}
