//! `switchyard tasks` -- run a task list with verification and repair.
//!
//! The file holds a JSON array of tasks:
//!
//! ```text
//! [
//!   { "input": "summarise the latest bitcoin news" },
//!   { "input": "write a haiku about rain", "expectation": "three lines" }
//! ]
//! ```

use std::path::PathBuf;

use clap::Args;
use switchyard_core::{EventSink, Task, TaskStatus};
use switchyard_types::Config;
use tracing::info;

use super::{build_engine, render_payload};

/// Arguments for the `switchyard tasks` subcommand.
#[derive(Args)]
pub struct TasksArgs {
    /// Path to the JSON task list.
    pub file: PathBuf,

    /// Print results as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse a JSON task list.
pub fn parse_tasks(contents: &str) -> anyhow::Result<Vec<Task>> {
    serde_json::from_str(contents).map_err(|e| anyhow::anyhow!("invalid task file: {e}"))
}

pub async fn run(args: TasksArgs, config: Config) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(&args.file)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", args.file.display()))?;
    let tasks = parse_tasks(&contents)?;
    info!(file = %args.file.display(), tasks = tasks.len(), "task list loaded");
    let engine = build_engine(config).await?;

    let results = engine.execute_tasks(tasks, &EventSink::disabled()).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    for (index, result) in results.iter().enumerate() {
        let label = match result.status {
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Repaired => "repaired",
            TaskStatus::Failed => "FAILED",
        };
        println!("[{}/{}] {} -- {}", index + 1, results.len(), label, result.input);
        if let Some(repair) = &result.repair {
            println!("  repair: {}", repair.analysis);
        }
        for payload in &result.payloads {
            println!("{}\n", render_payload(payload));
        }
    }
    let failed = results
        .iter()
        .filter(|r| r.status == TaskStatus::Failed)
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} tasks failed", results.len());
    }
    Ok(())
}
