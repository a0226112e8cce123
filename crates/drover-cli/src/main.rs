mod commands;
mod plan;
mod sim;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::Commands;

#[derive(Parser)]
#[command(name = "drover")]
#[command(
    about = "Drover - drives fleet-wide node tasks through staged rollouts",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("drover=info,warn"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    // A second call loses the race for the global subscriber; keep whichever
    // one was installed first.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Validate(cmd) => cmd.execute(),
        Commands::Run(cmd) => cmd.execute().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    run_cli(Cli::parse()).await
}
