// ABOUTME: `hatchery run`: the agent runner process started inside a sandbox
// ABOUTME: Logs go to stderr so stdout carries only event lines

use anyhow::{Context, Result};
use clap::Args;
use hatchery_agents::{default_runner, AgentRequest, BackendKind, SdkConfig};
use hatchery_cli::logging::{self, LogTarget};
use hatchery_cli::run::run_agent;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::BufReader;

#[derive(Args)]
pub struct RunArgs {
    /// cli, sdk or acp
    #[arg(long)]
    backend: BackendKind,

    /// Agent tool name, e.g. claude
    #[arg(long)]
    agent: String,

    #[arg(long)]
    prompt: String,

    #[arg(long)]
    model: Option<String>,

    /// Working directory of the agent process
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Seconds a prompt stays answerable; 0 waits forever
    #[arg(long, default_value = "0")]
    prompt_timeout_secs: u64,
}

pub async fn execute(args: RunArgs, verbose: bool) -> Result<i32> {
    logging::init(verbose, LogTarget::Stderr);

    let timeout = (args.prompt_timeout_secs > 0).then(|| Duration::from_secs(args.prompt_timeout_secs));
    let runner = default_runner(SdkConfig::from_env())
        .context("Failed to set up agent backends")?
        .with_prompt_timeout(timeout);

    let mut request = AgentRequest::new(args.backend, args.agent, args.prompt);
    request.model = args.model;
    request.working_dir = args.workdir;

    run_agent(
        &runner,
        request,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}
