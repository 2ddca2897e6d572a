//! `switchyard route` -- print the routing decision for a request.

use clap::Args;
use switchyard_types::Config;

use super::build_engine;

/// Arguments for the `switchyard route` subcommand.
#[derive(Args)]
pub struct RouteArgs {
    /// The request text.
    pub text: String,

    /// Print the decision as JSON.
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: RouteArgs, config: Config) -> anyhow::Result<()> {
    let engine = build_engine(config).await?;
    let decision = engine.route(&args.text).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
        return Ok(());
    }
    println!(
        "method: {:?} (threshold {:.2})",
        decision.method,
        engine.router().threshold()
    );
    for scored in &decision.workers {
        println!("  {:<12} {:.3}", scored.worker, scored.confidence);
    }
    Ok(())
}
