use anyhow::Result;
use clap::{Parser, Subcommand};
use runlens_client::{ListPage, RunAction, DEFAULT_LIST_LIMIT};
use runlens_core::{RunId, RunStatus};
use tracing::error;

mod commands;
mod config;
mod format;
mod logging;
#[cfg(test)]
mod test_support;
mod view;

use config::{load_config, GlobalArgs};
use logging::init_logging;

#[derive(Parser)]
#[command(name = "runlens")]
#[command(about = "Inspect, stream and act on agent runs", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recent runs
    List {
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        /// Keep only runs with this status
        #[arg(long)]
        status: Option<RunStatus>,
        /// Match against run id, agent name or prompt
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print one run with its step timeline
    Show {
        run: RunId,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Follow a run's steps as they arrive
    Tail { run: RunId },
    /// Interactive view with live steps and evaluate/replay keys
    Watch { run: RunId },
    /// Evaluate a run and wait for the result
    Evaluate { run: RunId },
    /// Replay a run
    Replay { run: RunId },
    /// Delete a run
    Delete { run: RunId },
}

impl Commands {
    fn log_tag(&self) -> &'static str {
        match self {
            Commands::List { .. } => "list",
            Commands::Show { .. } => "show",
            Commands::Tail { .. } => "tail",
            Commands::Watch { .. } => "watch",
            Commands::Evaluate { .. } => "evaluate",
            Commands::Replay { .. } => "replay",
            Commands::Delete { .. } => "delete",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;
    let _log_guard = init_logging(&config, cli.command.log_tag());
    let api = commands::build_api(&config)?;

    let result = match cli.command {
        Commands::List {
            limit,
            offset,
            status,
            query,
            json,
        } => {
            commands::list(
                &*api,
                ListPage { limit, offset },
                status,
                query.as_deref(),
                json,
            )
            .await
        }
        Commands::Show { run, json } => commands::show(&*api, run, json).await,
        Commands::Tail { run } => commands::tail(api, &config, run).await,
        Commands::Watch { run } => view::run_watch(api, &config, run).await,
        Commands::Evaluate { run } => {
            commands::run_action(api, config.actions, run, RunAction::Evaluate).await
        }
        Commands::Replay { run } => {
            commands::run_action(api, config.actions, run, RunAction::Replay).await
        }
        Commands::Delete { run } => commands::delete(&*api, run).await,
    };
    if let Err(err) = &result {
        error!("command_failed: {err:#}");
    }
    result
}
