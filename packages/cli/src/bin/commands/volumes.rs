// ABOUTME: `hatchery volumes`: list or prune sandbox volumes whose sandbox is gone
// ABOUTME: Targets the local daemon, or any target connection described in a JSON file

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use hatchery_cli::logging::{self, LogTarget};
use hatchery_cli::volumes::{known_sandbox_ids, orphan_table, prune_summary};
use hatchery_core::{ComputeTarget, TargetConnection};
use hatchery_sandbox::{provider_for_target, VolumeManager};
use std::path::PathBuf;

#[derive(Args)]
pub struct VolumesArgs {
    /// JSON file with a target connection, e.g. {"kind":"tunneled",...}; local daemon when omitted
    #[arg(long, global = true)]
    target: Option<PathBuf>,

    /// Sandbox ids to treat as live even without a unit
    #[arg(long, global = true)]
    keep: Vec<String>,

    #[command(subcommand)]
    command: VolumesCommands,
}

#[derive(Subcommand)]
pub enum VolumesCommands {
    /// List orphaned volumes
    Orphans {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove orphaned volumes that are not mounted
    Prune,
}

fn load_connection(path: Option<&PathBuf>) -> Result<TargetConnection> {
    let Some(path) = path else {
        return Ok(TargetConnection::Direct { socket_path: None });
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid target connection in {}", path.display()))
}

pub async fn execute(args: VolumesArgs, verbose: bool) -> Result<()> {
    logging::init(verbose, LogTarget::Stderr);

    let target = ComputeTarget::new("volumes-cli", load_connection(args.target.as_ref())?);
    let provider = provider_for_target(&target)?;
    let known = known_sandbox_ids(provider.as_ref(), &args.keep)
        .await
        .context("Failed to list sandbox units")?;
    let manager = VolumeManager::new(provider);

    match args.command {
        VolumesCommands::Orphans { json } => {
            let orphans = manager.find_orphans(&known).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&orphans)?);
            } else if orphans.is_empty() {
                println!("No orphaned volumes");
            } else {
                println!("{}", orphan_table(&orphans));
            }
        }
        VolumesCommands::Prune => {
            let report = manager.remove_orphans(&known).await?;
            println!("{}", prune_summary(&report));
        }
    }
    Ok(())
}
