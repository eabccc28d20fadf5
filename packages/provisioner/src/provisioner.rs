// ABOUTME: CLI provisioner bound to one provider and one compute unit
// ABOUTME: Shared command helpers used by the install, setup and execute steps

use crate::config::ProvisionerConfig;
use hatchery_sandbox::{ContainerProvider, ExecOutput};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const SYNOPSIS_MAX_CHARS: usize = 240;

/// Prepares and drives one sandbox through its provider's exec channel
pub struct CliProvisioner {
    provider: Arc<dyn ContainerProvider>,
    container_id: String,
    config: ProvisionerConfig,
}

impl CliProvisioner {
    pub fn new(
        provider: Arc<dyn ContainerProvider>,
        container_id: impl Into<String>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            provider,
            container_id: container_id.into(),
            config,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub(crate) async fn exec(&self, argv: &[&str], env: &HashMap<String, String>) -> ExecOutput {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        debug!(container_id = %self.container_id, command = %argv.join(" "), "exec");
        self.provider
            .execute_command(&self.container_id, &argv, env)
            .await
    }

    pub(crate) async fn sh(&self, script: &str) -> ExecOutput {
        self.exec(&["sh", "-c", script], &HashMap::new()).await
    }
}

/// One-line human summary of a failed command: its last non-empty output line
pub fn synopsis(output: &ExecOutput) -> String {
    let line = output
        .output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty());
    match line {
        Some(line) if line.chars().count() > SYNOPSIS_MAX_CHARS => {
            let cut: String = line.chars().take(SYNOPSIS_MAX_CHARS).collect();
            format!("{}...", cut)
        }
        Some(line) => line.to_string(),
        None => format!("exit code {}", output.exit_code),
    }
}

/// Quote a value for a POSIX shell
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synopsis_uses_last_line() {
        let output = ExecOutput::new(1, "npm notice\nnpm ERR! 404 Not Found\n\n");
        assert_eq!(synopsis(&output), "npm ERR! 404 Not Found");
        assert_eq!(synopsis(&ExecOutput::new(137, "")), "exit code 137");
    }

    #[test]
    fn test_synopsis_is_bounded() {
        let output = ExecOutput::new(1, "x".repeat(1000));
        assert_eq!(synopsis(&output).chars().count(), SYNOPSIS_MAX_CHARS + 3);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
