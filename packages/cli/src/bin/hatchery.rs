// ABOUTME: Entry point of the hatchery binary
// ABOUTME: Dispatches to the API server, the remote worker, the agent runner and volume maintenance

use clap::{Parser, Subcommand};
use colored::*;
use std::process;

mod commands;

use commands::remote::RemoteArgs;
use commands::run::RunArgs;
use commands::serve::ServeArgs;
use commands::volumes::VolumesArgs;

#[derive(Parser)]
#[command(name = "hatchery")]
#[command(about = "Hatchery - sandboxed coding agents on local, remote and cluster compute")]
#[command(version)]
struct Cli {
    /// Debug logging for hatchery crates (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve(ServeArgs),
    /// Run the worker for a registered compute target
    Remote(RemoteArgs),
    /// Run one agent and stream its events as JSON lines on stdout
    Run(RunArgs),
    /// Find or remove sandbox volumes no sandbox owns any more
    Volumes(VolumesArgs),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => commands::serve::execute(args, cli.verbose).await,
        Commands::Remote(args) => commands::remote::execute(args, cli.verbose).await,
        Commands::Run(args) => match commands::run::execute(args, cli.verbose).await {
            Ok(code) => process::exit(code),
            Err(e) => Err(e),
        },
        Commands::Volumes(args) => commands::volumes::execute(args, cli.verbose).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}
