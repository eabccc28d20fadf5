// ABOUTME: Agent Client Protocol backend speaking JSON-RPC 2.0 over an agent process's stdio
// ABOUTME: Streams session updates as events and routes permission requests through prompts

use super::AgentCommand;
use crate::events::AgentEvent;
use crate::runner::{AgentBackend, AgentRequest, BackendKind, Result, RunContext, RunOutcome, RunnerError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: u64 = 1;
const METHOD_NOT_FOUND: i64 = -32601;
const DEFAULT_CWD: &str = "/workspace";
/// How long to wait for the prompt turn to wind down after session/cancel
const CANCEL_GRACE: Duration = Duration::from_secs(5);

pub struct AcpBackend {
    commands: HashMap<String, AgentCommand>,
}

impl Default for AcpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AcpBackend {
    /// Backend preloaded with the ACP adapters of the known agents
    pub fn new() -> Self {
        let mut commands = HashMap::new();
        commands.insert(
            "claude".to_string(),
            AgentCommand::new("claude-code-acp", Vec::<String>::new()),
        );
        commands.insert(
            "gemini".to_string(),
            AgentCommand::new("gemini", ["--experimental-acp"]),
        );
        commands.insert(
            "codex".to_string(),
            AgentCommand::new("codex-acp", Vec::<String>::new()),
        );
        Self { commands }
    }

    /// Launch template for an agent, if this backend knows it
    pub fn command_for(&self, agent: &str) -> Option<&AgentCommand> {
        self.commands.get(agent)
    }

    pub fn with_command(mut self, agent: impl Into<String>, command: AgentCommand) -> Self {
        self.commands.insert(agent.into(), command);
        self
    }
}

#[async_trait]
impl AgentBackend for AcpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Acp
    }

    async fn run(&self, request: &AgentRequest, ctx: &RunContext) -> Result<RunOutcome> {
        let command = self
            .commands
            .get(&request.agent)
            .ok_or_else(|| RunnerError::UnsupportedAgent {
                backend: BackendKind::Acp,
                agent: request.agent.clone(),
            })?;

        info!(agent = %request.agent, program = %command.program, "Starting ACP agent");
        let mut process = command.command(request);
        // Agent diagnostics share our stderr
        process.stderr(Stdio::inherit());
        let mut child = process.spawn().map_err(RunnerError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Protocol("agent stdout was not captured".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::Protocol("agent stdin was not captured".to_string()))?;

        let outcome = run_session(stdout, stdin, request, ctx).await;
        if let Err(e) = child.kill().await {
            debug!("ACP agent already gone: {}", e);
        }
        outcome
    }
}

/// Drive one prompt turn over an established byte stream pair
pub async fn run_session<R, W>(
    reader: R,
    writer: W,
    request: &AgentRequest,
    ctx: &RunContext,
) -> Result<RunOutcome>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut conn = AcpConnection::new(reader, writer);

    let init = conn
        .request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientCapabilities": {
                    "fs": {"readTextFile": false, "writeTextFile": false},
                    "terminal": false
                }
            }),
            ctx,
        )
        .await?;
    debug!(agent_info = ?init.get("agentInfo"), "ACP agent initialized");

    let cwd = request
        .working_dir
        .as_ref()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|| DEFAULT_CWD.to_string());
    let session = conn
        .request("session/new", json!({"cwd": cwd, "mcpServers": []}), ctx)
        .await?;
    let session_id = session["sessionId"]
        .as_str()
        .ok_or_else(|| RunnerError::Protocol("session/new returned no sessionId".to_string()))?
        .to_string();
    conn.session_id = Some(session_id.clone());

    let result = conn
        .request(
            "session/prompt",
            json!({
                "sessionId": session_id,
                "prompt": [{"type": "text", "text": request.prompt}]
            }),
            ctx,
        )
        .await?;

    Ok(outcome_for_stop_reason(result["stopReason"].as_str()))
}

fn outcome_for_stop_reason(reason: Option<&str>) -> RunOutcome {
    match reason {
        Some("cancelled") => RunOutcome::cancelled(),
        Some(reason @ ("max_tokens" | "max_turn_requests" | "refusal")) => {
            RunOutcome::failed(None, format!("agent stopped: {}", reason))
        }
        _ => RunOutcome::completed(None),
    }
}

struct AcpConnection<R, W> {
    lines: Lines<BufReader<R>>,
    writer: W,
    next_id: u64,
    session_id: Option<String>,
    cancel_sent: bool,
}

impl<R, W> AcpConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn new(reader: R, writer: W) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 0,
            session_id: None,
            cancel_sent: false,
        }
    }

    async fn write(&mut self, message: Value) -> Result<()> {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send a request and service agent traffic until its response arrives
    async fn request(&mut self, method: &str, params: Value, ctx: &RunContext) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        self.write(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await?;

        loop {
            let message = self.read_message(ctx).await?;
            if message.get("method").is_some() {
                self.handle_incoming(message, ctx).await?;
                continue;
            }
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                debug!("Ignoring unexpected response: {}", message);
                continue;
            }
            if let Some(error) = message.get("error") {
                return Err(RunnerError::Protocol(format!(
                    "{} failed: {}",
                    method,
                    error["message"].as_str().unwrap_or("unknown error")
                )));
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn read_message(&mut self, ctx: &RunContext) -> Result<Value> {
        loop {
            let line = if self.cancel_sent {
                match tokio::time::timeout(CANCEL_GRACE, self.lines.next_line()).await {
                    Ok(line) => line?,
                    Err(_) => return Err(RunnerError::Cancelled),
                }
            } else {
                let next = tokio::select! {
                    line = self.lines.next_line() => Some(line),
                    _ = ctx.cancelled() => None,
                };
                match next {
                    Some(line) => line?,
                    None => {
                        self.send_cancel().await?;
                        continue;
                    }
                }
            };

            let Some(line) = line else {
                return Err(if self.cancel_sent {
                    RunnerError::Cancelled
                } else {
                    RunnerError::Protocol("agent closed the connection".to_string())
                });
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(message) => return Ok(message),
                Err(_) => debug!("Skipping non-JSON agent output: {}", trimmed),
            }
        }
    }

    /// Ask the agent to stop the current turn; without a session there is nothing to wind down
    async fn send_cancel(&mut self) -> Result<()> {
        let Some(session_id) = self.session_id.clone() else {
            return Err(RunnerError::Cancelled);
        };
        if !self.cancel_sent {
            self.cancel_sent = true;
            info!(session_id = %session_id, "Cancelling ACP session");
            self.write(json!({
                "jsonrpc": "2.0",
                "method": "session/cancel",
                "params": {"sessionId": session_id}
            }))
            .await?;
        }
        Ok(())
    }

    async fn handle_incoming(&mut self, message: Value, ctx: &RunContext) -> Result<()> {
        let method = message["method"].as_str().unwrap_or_default().to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match (method.as_str(), message.get("id").cloned()) {
            ("session/update", None) => handle_update(&params, ctx).await,
            ("session/request_permission", Some(id)) => {
                let outcome = self.request_permission(&params, ctx).await?;
                self.write(json!({"jsonrpc": "2.0", "id": id, "result": {"outcome": outcome}}))
                    .await?;
                if ctx.is_cancelled() {
                    self.send_cancel().await?;
                }
                Ok(())
            }
            (_, Some(id)) => {
                warn!(method = %method, "Agent called an unsupported client method");
                self.write(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": METHOD_NOT_FOUND, "message": format!("Method not found: {}", method)}
                }))
                .await
            }
            (_, None) => {
                debug!(method = %method, "Ignoring agent notification");
                Ok(())
            }
        }
    }

    async fn request_permission(&mut self, params: &Value, ctx: &RunContext) -> Result<Value> {
        if self.cancel_sent {
            return Ok(json!({"outcome": "cancelled"}));
        }
        let message = params["toolCall"]["title"]
            .as_str()
            .map(|title| format!("Allow {}?", title))
            .unwrap_or_else(|| "The agent requests permission".to_string());

        match ctx.ask(message, &params["options"]).await {
            Ok(Some(option)) => Ok(json!({"outcome": "selected", "optionId": option.id})),
            Ok(None) | Err(RunnerError::Cancelled) => Ok(json!({"outcome": "cancelled"})),
            Err(e) => Err(e),
        }
    }
}

async fn handle_update(params: &Value, ctx: &RunContext) -> Result<()> {
    let update = &params["update"];
    match update["sessionUpdate"].as_str() {
        Some("agent_message_chunk") => {
            if let Some(text) = update["content"]["text"].as_str() {
                ctx.emit(AgentEvent::stdout(text)).await?;
            }
            Ok(())
        }
        Some("tool_call") => {
            let name = update["title"]
                .as_str()
                .or_else(|| update["kind"].as_str())
                .unwrap_or("tool");
            ctx.emit(AgentEvent::ToolCall {
                id: update["toolCallId"].as_str().unwrap_or_default().to_string(),
                name: name.to_string(),
                input: update.get("rawInput").cloned().unwrap_or(Value::Null),
            })
            .await
        }
        other => {
            debug!(update = ?other, "Ignoring session update");
            Ok(())
        }
    }
}
