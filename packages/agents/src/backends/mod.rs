// ABOUTME: Agent runner backends and the command templates used to launch agent processes
// ABOUTME: Direct CLI invocation, streaming SDK calls and agent-protocol sessions

pub mod acp;
pub mod cli;
pub mod sdk;

pub use acp::AcpBackend;
pub use cli::CliBackend;
pub use sdk::{SdkBackend, SdkConfig};

use crate::runner::AgentRequest;
use std::process::Stdio;
use tokio::process::Command;

const PROMPT_PLACEHOLDER: &str = "{prompt}";
const MODEL_PLACEHOLDER: &str = "{model}";

/// Program plus argument template for launching one agent.
///
/// `{prompt}` and `{model}` in arguments are substituted per request;
/// `model_args` are appended only when the request names a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub model_args: Vec<String>,
}

impl AgentCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            model_args: Vec::new(),
        }
    }

    pub fn with_model_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn render_args(&self, request: &AgentRequest) -> Vec<String> {
        let model = request.model.as_deref().unwrap_or_default();
        let substitute =
            |arg: &String| arg.replace(PROMPT_PLACEHOLDER, &request.prompt).replace(MODEL_PLACEHOLDER, model);

        let mut args: Vec<String> = self.args.iter().map(substitute).collect();
        if request.model.is_some() {
            args.extend(self.model_args.iter().map(substitute));
        }
        args
    }

    /// Build a piped, kill-on-drop process for this request
    pub(crate) fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(request))
            .envs(&request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::BackendKind;

    #[test]
    fn test_render_substitutes_placeholders() {
        let command = AgentCommand::new("claude", ["-p", "{prompt}"]).with_model_args(["--model", "{model}"]);
        let mut request = AgentRequest::new(BackendKind::Cli, "claude", "fix the tests");

        assert_eq!(command.render_args(&request), vec!["-p", "fix the tests"]);

        request.model = Some("opus".to_string());
        assert_eq!(
            command.render_args(&request),
            vec!["-p", "fix the tests", "--model", "opus"]
        );
    }
}
