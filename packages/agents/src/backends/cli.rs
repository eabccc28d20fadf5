// ABOUTME: Direct CLI backend that spawns the agent tool and streams its output lines
// ABOUTME: Tool-use and prompt JSON lines are lifted into structured events; exit code decides the status

use super::AgentCommand;
use crate::events::AgentEvent;
use crate::runner::{AgentBackend, AgentRequest, BackendKind, Result, RunContext, RunOutcome, RunnerError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tracing::{debug, info, warn};

/// Exit code reported when the process was terminated by a signal
const SIGNALLED_EXIT_CODE: i32 = -1;

pub struct CliBackend {
    commands: HashMap<String, AgentCommand>,
}

impl Default for CliBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CliBackend {
    /// Backend preloaded with the non-interactive invocations of the known agent tools
    pub fn new() -> Self {
        let mut commands = HashMap::new();
        commands.insert(
            "claude".to_string(),
            AgentCommand::new("claude", ["-p", "{prompt}", "--dangerously-skip-permissions"])
                .with_model_args(["--model", "{model}"]),
        );
        commands.insert(
            "codex".to_string(),
            AgentCommand::new("codex", ["exec", "--full-auto", "{prompt}"])
                .with_model_args(["-m", "{model}"]),
        );
        commands.insert(
            "gemini".to_string(),
            AgentCommand::new("gemini", ["-p", "{prompt}", "--yolo"])
                .with_model_args(["-m", "{model}"]),
        );
        commands.insert(
            "opencode".to_string(),
            AgentCommand::new("opencode", ["run", "{prompt}"]).with_model_args(["-m", "{model}"]),
        );
        Self { commands }
    }

    /// Launch template for an agent, if this backend knows it
    pub fn command_for(&self, agent: &str) -> Option<&AgentCommand> {
        self.commands.get(agent)
    }

    pub fn empty() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    pub fn with_command(mut self, agent: impl Into<String>, command: AgentCommand) -> Self {
        self.commands.insert(agent.into(), command);
        self
    }

    async fn handle_stdout(
        &self,
        line: String,
        ctx: &RunContext,
        stdin: &mut Option<ChildStdin>,
    ) -> Result<()> {
        match parse_line(&line) {
            OutputLine::Text => ctx.emit(AgentEvent::stdout(line)).await,
            OutputLine::ToolCall { id, name, input } => {
                ctx.emit(AgentEvent::ToolCall { id, name, input }).await
            }
            OutputLine::Prompt { message, options } => {
                let answer = ctx.ask(message, &options).await?;
                let Some(stdin) = stdin.as_mut() else {
                    warn!("Agent asked a question but its stdin is closed");
                    return Ok(());
                };
                let reply = match answer {
                    Some(option) => json!({
                        "type": "answer",
                        "optionId": option.id,
                        "value": option.value,
                    }),
                    None => json!({"type": "answer", "expired": true}),
                };
                let mut bytes = serde_json::to_vec(&reply)?;
                bytes.push(b'\n');
                stdin.write_all(&bytes).await?;
                stdin.flush().await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl AgentBackend for CliBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cli
    }

    async fn run(&self, request: &AgentRequest, ctx: &RunContext) -> Result<RunOutcome> {
        let command = self
            .commands
            .get(&request.agent)
            .ok_or_else(|| RunnerError::UnsupportedAgent {
                backend: BackendKind::Cli,
                agent: request.agent.clone(),
            })?;

        info!(agent = %request.agent, program = %command.program, "Spawning agent CLI");
        let mut child = command.command(request).spawn().map_err(RunnerError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Protocol("agent stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Protocol("agent stderr was not captured".to_string()))?;
        let mut stdin = child.stdin.take();

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            tokio::select! {
                _ = ctx.cancelled() => return terminate(&mut child).await,
                line = out_lines.next_line(), if out_open => match line? {
                    Some(line) => match self.handle_stdout(line, ctx, &mut stdin).await {
                        Err(RunnerError::Cancelled) => return terminate(&mut child).await,
                        other => other?,
                    },
                    None => out_open = false,
                },
                line = err_lines.next_line(), if err_open => match line? {
                    Some(line) => ctx.emit(AgentEvent::stderr(line)).await?,
                    None => err_open = false,
                },
            }
        }

        // Both streams are closed; let the process know no more answers are coming
        drop(stdin);

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = ctx.cancelled() => return terminate(&mut child).await,
        };

        let code = status.code().unwrap_or(SIGNALLED_EXIT_CODE);
        debug!(agent = %request.agent, exit_code = code, "Agent CLI exited");
        if status.success() {
            Ok(RunOutcome::completed(Some(code)))
        } else {
            Ok(RunOutcome::failed(
                Some(code),
                format!("{} exited with code {}", request.agent, code),
            ))
        }
    }
}

async fn terminate(child: &mut Child) -> Result<RunOutcome> {
    if let Err(e) = child.kill().await {
        debug!("Failed to kill agent process: {}", e);
    }
    Ok(RunOutcome::cancelled())
}

#[derive(Debug, PartialEq)]
enum OutputLine {
    Text,
    ToolCall { id: String, name: String, input: Value },
    Prompt { message: String, options: Value },
}

/// Classify one stdout line.
///
/// Recognizes `tool_use`/`tool_call` objects and `prompt` objects carrying an
/// option list; everything else, JSON or not, is plain output.
fn parse_line(line: &str) -> OutputLine {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return OutputLine::Text;
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return OutputLine::Text;
    };

    match value.get("type").and_then(Value::as_str) {
        Some("tool_use") | Some("tool_call") => {
            let Some(name) = value.get("name").and_then(Value::as_str) else {
                return OutputLine::Text;
            };
            OutputLine::ToolCall {
                id: value
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: name.to_string(),
                input: value.get("input").cloned().unwrap_or(Value::Null),
            }
        }
        Some("prompt") if value.get("options").is_some() => OutputLine::Prompt {
            message: value
                .get("message")
                .or_else(|| value.get("question"))
                .and_then(Value::as_str)
                .unwrap_or("The agent needs an answer")
                .to_string(),
            options: value["options"].clone(),
        },
        _ => OutputLine::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_lines_are_text() {
        assert_eq!(parse_line("Reading src/main.rs"), OutputLine::Text);
        assert_eq!(parse_line("{not json"), OutputLine::Text);
        assert_eq!(parse_line(r#"{"type":"result","text":"done"}"#), OutputLine::Text);
    }

    #[test]
    fn test_tool_use_line() {
        assert_eq!(
            parse_line(r#"{"type":"tool_use","id":"toolu_9","name":"Edit","input":{"file":"a.rs"}}"#),
            OutputLine::ToolCall {
                id: "toolu_9".to_string(),
                name: "Edit".to_string(),
                input: json!({"file": "a.rs"}),
            }
        );
    }

    #[test]
    fn test_prompt_line_keeps_raw_options() {
        assert_eq!(
            parse_line(r#"{"type":"prompt","question":"Overwrite?","options":{"y":"Yes","n":"No"}}"#),
            OutputLine::Prompt {
                message: "Overwrite?".to_string(),
                options: json!({"y": "Yes", "n": "No"}),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_agent_is_unsupported() {
        let backend = CliBackend::empty();
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let ctx = RunContext::new(
            tx,
            std::sync::Arc::new(crate::prompts::PromptTracker::new()),
            tokio_util::sync::CancellationToken::new(),
            None,
        );
        let result = backend
            .run(&AgentRequest::new(BackendKind::Cli, "nope", "x"), &ctx)
            .await;
        assert!(matches!(result, Err(RunnerError::UnsupportedAgent { .. })));
    }
}
