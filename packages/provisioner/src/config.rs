// ABOUTME: Provisioner configuration and the install table of supported agent tools
// ABOUTME: Each tool has a latest install and a known-good pinned fallback

use hatchery_core::constants::WORKSPACE_DIR;
use std::env;
use std::time::Duration;

const DEFAULT_RUNNER_RELEASE_URL: &str = "https://github.com/hatchery-dev/hatchery/releases";
/// Runner release installed when the latest download fails
pub const RUNNER_FALLBACK_VERSION: &str = "0.1.0";
/// Name of the runner binary inside the sandbox
pub const RUNNER_BINARY: &str = "hatchery";

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Checkout location inside the sandbox
    pub repo_dir: String,
    /// Base URL of runner binary releases
    pub runner_release_url: String,
    /// How long the runner keeps a prompt open before treating it as unanswered
    pub prompt_timeout: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            repo_dir: format!("{}/repo", WORKSPACE_DIR),
            runner_release_url: DEFAULT_RUNNER_RELEASE_URL.to_string(),
            prompt_timeout: Duration::from_secs(60),
        }
    }
}

impl ProvisionerConfig {
    /// Defaults overridden by HATCHERY_RUNNER_RELEASE_URL
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("HATCHERY_RUNNER_RELEASE_URL") {
            if !url.trim().is_empty() {
                config.runner_release_url = url.trim_end_matches('/').to_string();
            }
        }
        config
    }
}

/// How to install one agent tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentTool {
    pub name: &'static str,
    pub package: &'static str,
    pub binary: &'static str,
    pub fallback_version: &'static str,
    /// npm package providing the agent-protocol adapter, when separate from the tool
    pub acp_package: Option<&'static str>,
}

pub const AGENT_TOOLS: &[AgentTool] = &[
    AgentTool {
        name: "claude",
        package: "@anthropic-ai/claude-code",
        binary: "claude",
        fallback_version: "1.0.128",
        acp_package: Some("@zed-industries/claude-code-acp"),
    },
    AgentTool {
        name: "codex",
        package: "@openai/codex",
        binary: "codex",
        fallback_version: "0.39.0",
        acp_package: Some("@zed-industries/codex-acp"),
    },
    AgentTool {
        name: "gemini",
        package: "@google/gemini-cli",
        binary: "gemini",
        fallback_version: "0.6.1",
        acp_package: None,
    },
    AgentTool {
        name: "opencode",
        package: "opencode-ai",
        binary: "opencode",
        fallback_version: "0.11.1",
        acp_package: None,
    },
];

pub fn agent_tool(name: &str) -> Option<&'static AgentTool> {
    AGENT_TOOLS.iter().find(|tool| tool.name == name)
}
