//! `switchyard run` -- run one request through the pipeline.
//!
//! # Example
//!
//! ```text
//! switchyard run "what is the bitcoin price"
//! switchyard run "what is the bitcoin price" --json --events
//! ```

use clap::Args;
use switchyard_core::EventSink;
use switchyard_types::Config;
use tracing::warn;

use super::{build_engine, render_payload};

/// Arguments for the `switchyard run` subcommand.
#[derive(Args)]
pub struct RunArgs {
    /// The request text.
    pub text: String,

    /// Print payloads as JSON.
    #[arg(long)]
    pub json: bool,

    /// Stream pipeline events to stderr as JSON lines.
    #[arg(long)]
    pub events: bool,
}

pub async fn run(args: RunArgs, config: Config) -> anyhow::Result<()> {
    let buffer = config.dispatch.event_buffer;
    let engine = build_engine(config).await?;

    let payloads = if args.events {
        let (sink, mut rx) = EventSink::channel(buffer);
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => eprintln!("{line}"),
                    Err(e) => warn!(error = %e, "unprintable event"),
                }
            }
        });
        let payloads = engine.run_with_events(&args.text, &sink).await;
        drop(sink);
        printer.await?;
        payloads
    } else {
        engine.run(&args.text).await
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&payloads)?);
    } else {
        for payload in &payloads {
            println!("{}\n", render_payload(payload));
        }
    }
    Ok(())
}
