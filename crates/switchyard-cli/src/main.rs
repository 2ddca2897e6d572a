//! `switchyard` -- CLI binary for the switchyard query-dispatch hub.
//!
//! Provides the following subcommands:
//!
//! - `switchyard run` -- Run one request through the pipeline.
//! - `switchyard tasks` -- Run a task list with verification and repair.
//! - `switchyard route` -- Show which workers a request would reach.
//! - `switchyard status` -- Show configuration, workers and limiter state.
//! - `switchyard config show` -- Print the resolved configuration.

use clap::{Parser, Subcommand};

mod commands;

/// switchyard query-dispatch hub CLI.
#[derive(Parser)]
#[command(name = "switchyard", about = "switchyard query-dispatch hub", version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path (overrides auto-discovery).
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Run one request and print the worker payloads.
    Run(commands::run::RunArgs),

    /// Run a JSON task list.
    Tasks(commands::tasks::TasksArgs),

    /// Print the routing decision for a request without dispatching.
    Route(commands::route::RouteArgs),

    /// Show configuration and worker status.
    Status,

    /// Show resolved configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
}

/// Subcommands for `switchyard config`.
#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the resolved configuration as JSON.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = commands::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => commands::run::run(args, config).await?,
        Commands::Tasks(args) => commands::tasks::run(args, config).await?,
        Commands::Route(args) => commands::route::run(args, config).await?,
        Commands::Status => commands::status::run(config).await?,
        Commands::Config { action } => match action {
            ConfigCmd::Show => commands::config_cmd::show(&config)?,
        },
    }
    Ok(())
}
