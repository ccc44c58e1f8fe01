//! Operator CLI for coordinated batched updates.
//!
//! `plan` materializes a selection and reports its size, `mutate` waits out
//! conflicting refresh runs and then rewrites the selection in batches, and
//! `wait` only performs the conflict wait. Results are printed as JSON on
//! stdout; logs go to stderr.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{MutateArgs, PlanArgs, WaitArgs};
use crate::config::CtlConfig;

#[derive(Parser, Debug)]
#[command(name = "refreshctl")]
#[command(about = "Batched, coordinated updates against live media tables", long_about = None)]
struct Cli {
    /// Overrides REFRESH_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Freeze the rows matching a predicate and report how many there are.
    Plan(PlanArgs),
    /// Wait for conflicting runs, then rewrite the selection batch by batch.
    Mutate(MutateArgs),
    /// Wait until no conflicting run holds this environment's resource tags.
    Wait(WaitArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("refresh_ctl=info,refresh_batch=info,refresh_coord=info,warn")
            }),
        )
        .init();

    let cli = Cli::parse();
    let mut config = CtlConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }

    match cli.cmd {
        Command::Plan(args) => commands::plan(&config, args).await,
        Command::Mutate(args) => commands::mutate(&config, args).await,
        Command::Wait(args) => commands::wait(&config, args).await,
    }
}
