// ABOUTME: Runs the installed agent against the checkout, directly or through the agent runner
// ABOUTME: Secrets travel only as environment of the single exec; runner output is parsed as event lines

use crate::config::RUNNER_BINARY;
use crate::error::{ProvisionError, Result};
use crate::provisioner::{synopsis, CliProvisioner};
use hatchery_agents::{AgentEvent, AgentRequest, BackendKind, CliBackend, RunStatus};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct AgentTaskRequest {
    pub agent: String,
    pub prompt: String,
    pub model: Option<String>,
    /// `None` runs the tool directly and returns plain text
    pub backend: Option<BackendKind>,
    /// API keys and tokens; exported for this one invocation only
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskResult {
    pub success: bool,
    pub exit_code: i64,
    /// What the agent said
    pub output: String,
    pub error_message: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub events: Vec<AgentEvent>,
    /// Everything the exec returned, for diagnosis
    pub raw_output: String,
}

/// Event lines recovered from runner output
#[derive(Debug, Default)]
pub struct ParsedRun {
    pub events: Vec<AgentEvent>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub text: String,
    pub status: Option<(RunStatus, Option<i32>, Option<String>)>,
}

/// Parse runner output; lines that are not events (logs, warnings) are skipped
pub fn parse_runner_output(raw: &str, backend: BackendKind) -> ParsedRun {
    let separator = if backend == BackendKind::Cli { "\n" } else { "" };
    let mut parsed = ParsedRun::default();
    let mut pieces: Vec<&str> = Vec::new();

    let events: Vec<AgentEvent> = raw.lines().filter_map(AgentEvent::from_line).collect();
    for event in &events {
        match event {
            AgentEvent::Stdout { text } => pieces.push(text),
            AgentEvent::ToolCall { id, name, input } => parsed.tool_calls.push(ToolCallRecord {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            AgentEvent::Status {
                status,
                exit_code,
                message,
            } if status.is_terminal() => {
                parsed.status = Some((*status, *exit_code, message.clone()));
            }
            _ => {}
        }
    }
    parsed.text = pieces.join(separator);
    parsed.events = events;
    parsed
}

impl CliProvisioner {
    /// Run the agent non-interactively in the checkout
    pub async fn execute_agent_task(&self, request: &AgentTaskRequest) -> Result<AgentTaskResult> {
        info!(
            container_id = %self.container_id(),
            agent = %request.agent,
            backend = ?request.backend,
            "Executing agent task"
        );
        match request.backend {
            None => self.execute_direct(request).await,
            Some(backend) => self.execute_with_runner(request, backend).await,
        }
    }

    async fn execute_direct(&self, request: &AgentTaskRequest) -> Result<AgentTaskResult> {
        let backend = CliBackend::new();
        let command = backend
            .command_for(&request.agent)
            .ok_or_else(|| ProvisionError::UnknownAgent(request.agent.clone()))?;

        let mut agent_request = AgentRequest::new(BackendKind::Cli, &request.agent, &request.prompt);
        agent_request.model = request.model.clone();
        let args = command.render_args(&agent_request);

        let repo_dir = self.config().repo_dir.clone();
        let mut argv = vec!["sh", "-c", "cd \"$1\" && shift && exec \"$@\"", "sh", repo_dir.as_str()];
        argv.push(&command.program);
        argv.extend(args.iter().map(String::as_str));

        let output = self.exec(&argv, &request.secrets).await;
        let success = output.success();
        let error_message = (!success).then(|| {
            format!(
                "{} exited with code {}: {}",
                request.agent,
                output.exit_code,
                synopsis(&output)
            )
        });
        Ok(AgentTaskResult {
            success,
            exit_code: output.exit_code,
            output: output.output.clone(),
            error_message,
            tool_calls: Vec::new(),
            events: Vec::new(),
            raw_output: output.output,
        })
    }

    async fn execute_with_runner(
        &self,
        request: &AgentTaskRequest,
        backend: BackendKind,
    ) -> Result<AgentTaskResult> {
        let repo_dir = self.config().repo_dir.clone();
        let prompt_timeout = self.config().prompt_timeout.as_secs().to_string();
        let mut argv = vec![
            RUNNER_BINARY,
            "run",
            "--backend",
            backend.as_str(),
            "--agent",
            request.agent.as_str(),
            "--workdir",
            repo_dir.as_str(),
            "--prompt-timeout-secs",
            prompt_timeout.as_str(),
            "--prompt",
            request.prompt.as_str(),
        ];
        if let Some(model) = &request.model {
            argv.extend(["--model", model.as_str()]);
        }

        let mut env = request.secrets.clone();
        env.entry("RUST_LOG".to_string())
            .or_insert_with(|| "hatchery=warn".to_string());

        let output = self.exec(&argv, &env).await;
        let parsed = parse_runner_output(&output.output, backend);

        let (success, error_message) = match &parsed.status {
            Some((RunStatus::Completed, _, _)) if output.success() => (true, None),
            Some((status, _, message)) => (
                false,
                Some(format!(
                    "agent run {}: {}",
                    match status {
                        RunStatus::Cancelled => "was cancelled",
                        _ => "failed",
                    },
                    message.clone().unwrap_or_else(|| synopsis(&output))
                )),
            ),
            None => {
                warn!(exit_code = output.exit_code, "Runner ended without a status event");
                (
                    false,
                    Some(format!("agent runner ended without a status: {}", synopsis(&output))),
                )
            }
        };
        let exit_code = parsed
            .status
            .as_ref()
            .and_then(|(_, code, _)| code.map(i64::from))
            .unwrap_or(output.exit_code);

        Ok(AgentTaskResult {
            success,
            exit_code,
            output: parsed.text,
            error_message,
            tool_calls: parsed.tool_calls,
            events: parsed.events,
            raw_output: output.output,
        })
    }
}
