// ABOUTME: `hatchery serve`: loads API configuration and serves until a shutdown signal
// ABOUTME: Tasks and targets live in the in-memory store for the lifetime of the process

use anyhow::{Context, Result};
use clap::Args;
use hatchery_api::{ApiConfig, AppState};
use hatchery_cli::logging::{self, LogTarget};
use hatchery_cli::shutdown;
use hatchery_core::MemoryStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on (overrides HATCHERY_BIND)
    #[arg(long)]
    bind: Option<SocketAddr>,
}

pub async fn execute(args: ServeArgs, verbose: bool) -> Result<()> {
    logging::init(verbose, LogTarget::Stdout);

    let mut config = ApiConfig::from_env().context("Invalid API configuration")?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if config.user_tokens.is_empty() {
        warn!("HATCHERY_USER_TOKENS is empty; every user request will be rejected");
    }

    let state = AppState::new(Arc::new(MemoryStore::new()), config);
    hatchery_api::serve(state, shutdown::signal())
        .await
        .context("API server failed")
}
