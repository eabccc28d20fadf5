// ABOUTME: Agent tool, runner binary and agent-protocol adapter installation
// ABOUTME: Every install tries the latest release first and one pinned fallback after

use crate::config::{agent_tool, RUNNER_BINARY, RUNNER_FALLBACK_VERSION};
use crate::error::{ProvisionError, Result};
use crate::provisioner::{shell_quote, synopsis, CliProvisioner};
use hatchery_agents::{AcpBackend, BackendKind};
use serde::Serialize;
use tracing::{info, warn};

const RUNNER_INSTALL_PATH: &str = "/usr/local/bin/hatchery";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub success: bool,
    pub used_fallback: bool,
    /// True when the tool was already present and nothing was run
    pub skipped: bool,
    pub version: Option<String>,
    /// Synopsis of the primary attempt's failure
    pub error: Option<String>,
    pub output: String,
}

impl InstallResult {
    fn skipped(version: Option<String>) -> Self {
        Self {
            success: true,
            used_fallback: false,
            skipped: true,
            version,
            error: None,
            output: String::new(),
        }
    }
}

/// Everything installed for one task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub agent: InstallResult,
    pub runner: Option<InstallResult>,
    pub acp_agent: Option<InstallResult>,
}

impl InstallReport {
    pub fn success(&self) -> bool {
        self.agent.success
            && self.runner.as_ref().map_or(true, |r| r.success)
            && self.acp_agent.as_ref().map_or(true, |r| r.success)
    }

    /// Name and error of the first failed step
    pub fn failure(&self) -> Option<(&'static str, String)> {
        let steps = [
            ("agent", Some(&self.agent)),
            ("runner", self.runner.as_ref()),
            ("agent-protocol adapter", self.acp_agent.as_ref()),
        ];
        steps.into_iter().find_map(|(step, result)| {
            result.filter(|r| !r.success).map(|r| {
                (
                    step,
                    r.error.clone().unwrap_or_else(|| "install failed".to_string()),
                )
            })
        })
    }

    /// Combined install output for diagnosis
    pub fn output(&self) -> String {
        [Some(&self.agent), self.runner.as_ref(), self.acp_agent.as_ref()]
            .into_iter()
            .flatten()
            .map(|r| r.output.as_str())
            .filter(|o| !o.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// First version-looking token of a `--version` output
pub fn parse_version(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|token| token.trim_start_matches('v').trim_end_matches([',', ')', ';']))
        .find(|token| {
            token.chars().next().is_some_and(|c| c.is_ascii_digit()) && token.contains('.')
        })
        .map(str::to_string)
}

impl CliProvisioner {
    async fn detect_version(&self, binary: &str) -> Option<String> {
        let output = self.exec(&[binary, "--version"], &Default::default()).await;
        if output.success() {
            parse_version(&output.output)
        } else {
            None
        }
    }

    async fn install_with_fallback(
        &self,
        what: &str,
        primary: &str,
        fallback: &str,
        binary: &str,
        pinned_version: Option<&str>,
    ) -> InstallResult {
        info!(container_id = %self.container_id(), "Installing {}", what);
        let first = self.sh(primary).await;
        if first.success() {
            return InstallResult {
                success: true,
                used_fallback: false,
                skipped: false,
                version: self.detect_version(binary).await,
                error: None,
                output: first.output,
            };
        }

        let primary_error = synopsis(&first);
        warn!("Latest install of {} failed ({}), trying fallback", what, primary_error);

        let second = self.sh(fallback).await;
        let output = format!("{}\n{}", first.output, second.output);
        if second.success() {
            let version = self
                .detect_version(binary)
                .await
                .or_else(|| pinned_version.map(str::to_string));
            return InstallResult {
                success: true,
                used_fallback: true,
                skipped: false,
                version,
                error: None,
                output,
            };
        }

        warn!("Fallback install of {} failed: {}", what, synopsis(&second));
        InstallResult {
            success: false,
            used_fallback: true,
            skipped: false,
            version: None,
            error: Some(primary_error),
            output,
        }
    }

    /// Install an agent tool, falling back to its known-good version
    pub async fn install_agent(&self, agent: &str) -> Result<InstallResult> {
        let tool = agent_tool(agent).ok_or_else(|| ProvisionError::UnknownAgent(agent.to_string()))?;
        let primary = format!("npm install -g {}@latest", tool.package);
        let fallback = format!("npm install -g {}@{}", tool.package, tool.fallback_version);
        Ok(self
            .install_with_fallback(
                agent,
                &primary,
                &fallback,
                tool.binary,
                Some(tool.fallback_version),
            )
            .await)
    }

    /// Download the runner binary, falling back to the pinned release
    pub async fn install_runner(&self) -> InstallResult {
        let base = self.config().runner_release_url.trim_end_matches('/');
        let download = |url: String| {
            format!(
                "curl -fsSL {}-$(uname -m) -o {path} && chmod +x {path}",
                shell_quote(&url),
                path = RUNNER_INSTALL_PATH
            )
        };
        let primary = download(format!("{}/latest/download/{}-linux", base, RUNNER_BINARY));
        let fallback = download(format!(
            "{}/download/v{}/{}-linux",
            base, RUNNER_FALLBACK_VERSION, RUNNER_BINARY
        ));
        self.install_with_fallback(
            "agent runner",
            &primary,
            &fallback,
            RUNNER_BINARY,
            Some(RUNNER_FALLBACK_VERSION),
        )
        .await
    }

    /// Make sure the agent-protocol executable for `agent` is on PATH
    pub async fn install_acp_agent(&self, agent: &str) -> Result<InstallResult> {
        let backend = AcpBackend::new();
        let program = backend
            .command_for(agent)
            .map(|command| command.program.clone())
            .ok_or_else(|| ProvisionError::UnknownAgent(agent.to_string()))?;

        let present = self
            .sh(&format!("command -v {}", shell_quote(&program)))
            .await;
        if present.success() {
            info!(program = %program, "Agent-protocol executable already installed");
            return Ok(InstallResult::skipped(self.detect_version(&program).await));
        }

        let Some(package) = agent_tool(agent).and_then(|tool| tool.acp_package) else {
            return Ok(InstallResult {
                success: false,
                used_fallback: false,
                skipped: false,
                version: None,
                error: Some(format!("{} is not on PATH", program)),
                output: present.output,
            });
        };

        let primary = format!("npm install -g {}@latest", package);
        let fallback = format!("npm install -g --force {}", package);
        Ok(self
            .install_with_fallback(&program, &primary, &fallback, &program, None)
            .await)
    }

    /// Install what a task needs: the tool itself, plus the runner when a
    /// runner backend is requested, plus the adapter for agent-protocol runs
    pub async fn install_for(&self, agent: &str, backend: Option<BackendKind>) -> Result<InstallReport> {
        let agent_result = self.install_agent(agent).await?;
        let mut report = InstallReport {
            agent: agent_result,
            runner: None,
            acp_agent: None,
        };
        if !report.agent.success {
            return Ok(report);
        }

        if let Some(backend) = backend {
            let runner = self.install_runner().await;
            let runner_ok = runner.success;
            report.runner = Some(runner);
            if runner_ok && backend == BackendKind::Acp {
                report.acp_agent = Some(self.install_acp_agent(agent).await?);
            }
        }
        Ok(report)
    }
}
