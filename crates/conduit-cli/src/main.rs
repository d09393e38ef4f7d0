//! Console harness for the conduit engine.

mod relay;
mod run;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "conduit", about = "Admission-gated bounded processing pool", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a synthetic batch through an in-process conduit
    Run(run::RunArgs),
    /// Wire the conduit between two broker queues
    Relay(relay::RelayArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_thread_ids(true)
        .init();

    match Cli::parse().command {
        Command::Run(args) => run::run(args).await,
        Command::Relay(args) => relay::run(args).await,
    }
}
