// ABOUTME: The `hatchery run` process: one agent run streamed as JSON lines on stdout
// ABOUTME: Answers and cancellation arrive as JSON lines on stdin; the exit code mirrors the final status

use hatchery_agents::{AgentEvent, AgentRequest, AgentRunner, PromptTracker, RunHandle, RunStatus, RunnerInput};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit code of a cancelled run, as for an interrupted process
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// Final status event of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminal {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
}

pub fn process_exit_code(terminal: Option<Terminal>) -> i32 {
    match terminal {
        Some(Terminal {
            status: RunStatus::Completed,
            ..
        }) => 0,
        Some(Terminal {
            status: RunStatus::Cancelled,
            ..
        }) => CANCELLED_EXIT_CODE,
        Some(Terminal {
            exit_code: Some(code),
            ..
        }) if code > 0 => code,
        _ => 1,
    }
}

/// Apply one line of runner input
pub fn apply_input(line: &str, prompts: &PromptTracker, cancel: &CancellationToken) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<RunnerInput>(line) {
        Ok(RunnerInput::Answer {
            prompt_id,
            option_id,
        }) => match prompts.answer(&prompt_id, &option_id) {
            Ok(option) => debug!(prompt_id = %prompt_id, option = %option.id, "Prompt answered"),
            Err(e) => warn!(code = e.code(), "Answer rejected: {}", e),
        },
        Ok(RunnerInput::Cancel) => {
            debug!("Cancel requested");
            cancel.cancel();
        }
        Err(e) => warn!("Ignoring malformed input line: {}", e),
    }
}

pub async fn read_input<R>(input: R, prompts: Arc<PromptTracker>, cancel: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => apply_input(&line, &prompts, &cancel),
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read runner input: {}", e);
                break;
            }
        }
    }
}

/// Write every event as one line, flushing each, until the run ends
pub async fn forward_events<W>(handle: &mut RunHandle, output: &mut W) -> std::io::Result<Option<Terminal>>
where
    W: AsyncWrite + Unpin,
{
    let mut terminal = None;
    while let Some(event) = handle.next_event().await {
        if let AgentEvent::Status {
            status, exit_code, ..
        } = &event
        {
            if status.is_terminal() {
                terminal = Some(Terminal {
                    status: *status,
                    exit_code: *exit_code,
                });
            }
        }
        output.write_all(event.to_line().as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(terminal)
}

/// Run one agent to completion and return the process exit code
pub async fn run_agent<R, W>(
    runner: &AgentRunner,
    request: AgentRequest,
    input: R,
    mut output: W,
) -> anyhow::Result<i32>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let mut handle = runner.start(request)?;
    let reader = tokio::spawn(read_input(input, handle.prompts(), handle.cancel_token()));
    let terminal = forward_events(&mut handle, &mut output).await;
    reader.abort();
    Ok(process_exit_code(terminal?))
}
