// ABOUTME: `hatchery remote`: the worker for a registered target, run next to its container daemon
// ABOUTME: Flags override the HATCHERY_* environment; the agent token is only read from the environment

use anyhow::{Context, Result};
use clap::Args;
use hatchery_cli::logging::{self, LogTarget};
use hatchery_cli::shutdown;
use hatchery_provisioner::ProvisionerConfig;
use hatchery_remote::{Worker, WorkerConfig};
use hatchery_sandbox::{ContainerProvider, DockerProvider};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Args)]
pub struct RemoteArgs {
    /// Hatchery server URL (overrides HATCHERY_SERVER_URL)
    #[arg(long)]
    server_url: Option<String>,

    /// Registered target id (overrides HATCHERY_TARGET_ID)
    #[arg(long)]
    target_id: Option<String>,

    /// Seconds between task polls (overrides HATCHERY_POLL_INTERVAL_SECS)
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Container daemon socket; the daemon default when omitted
    #[arg(long)]
    docker_socket: Option<String>,
}

pub async fn execute(args: RemoteArgs, verbose: bool) -> Result<()> {
    logging::init(verbose, LogTarget::Stdout);

    let overrides = [
        ("HATCHERY_SERVER_URL", args.server_url.clone()),
        ("HATCHERY_TARGET_ID", args.target_id.clone()),
    ];
    let mut config = WorkerConfig::from_lookup(|name| {
        overrides
            .iter()
            .find(|(key, _)| *key == name)
            .and_then(|(_, value)| value.clone())
            .or_else(|| std::env::var(name).ok())
    })
    .context("Invalid worker configuration")?;
    if let Some(secs) = args.poll_interval_secs.filter(|s| *s > 0) {
        config.poll_interval = Duration::from_secs(secs);
    }

    let provider: Arc<dyn ContainerProvider> = match &args.docker_socket {
        Some(path) => Arc::new(DockerProvider::with_socket(path)?),
        None => Arc::new(DockerProvider::new()?),
    };
    let health = provider.health_check().await;
    if health.healthy {
        info!(version = ?health.version, "Container daemon reachable");
    } else {
        anyhow::bail!(
            "Container daemon unavailable: {}",
            health.message.unwrap_or_default()
        );
    }

    let worker = Arc::new(Worker::new(config, provider, ProvisionerConfig::from_env())?);
    worker.run(shutdown::signal()).await;
    Ok(())
}
