// ABOUTME: Streaming SDK backend calling the Anthropic Messages API with server-sent events
// ABOUTME: Text deltas become stdout events and completed tool_use blocks become tool_call events

use crate::events::AgentEvent;
use crate::runner::{AgentBackend, AgentRequest, BackendKind, Result, RunContext, RunOutcome, RunnerError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::{debug, error, info};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 8192;
const ANTHROPIC_VERSION: &str = "2023-06-01";
const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl SdkConfig {
    /// Reads ANTHROPIC_API_KEY and ANTHROPIC_MODEL
    pub fn from_env() -> Self {
        let api_key = env::var(API_KEY_VAR).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            info!("{} not set - SDK runs must pass a key in the request env", API_KEY_VAR);
        }
        Self {
            api_key,
            model: env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

pub struct SdkBackend {
    client: Client,
    config: SdkConfig,
}

impl SdkBackend {
    pub fn new(config: SdkConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }
}

/// A tool_use block whose JSON input is still streaming in
struct PendingToolCall {
    id: String,
    name: String,
    input_json: String,
}

/// Translates decoded stream events into agent events
#[derive(Default)]
struct StreamState {
    tools: HashMap<u64, PendingToolCall>,
    stop_reason: Option<String>,
}

impl StreamState {
    /// Returns an event to emit, or an error for an `error` stream event
    fn apply(&mut self, event: &Value) -> Result<Option<AgentEvent>> {
        let index = event["index"].as_u64().unwrap_or_default();
        match event["type"].as_str() {
            Some("content_block_start") if event["content_block"]["type"] == "tool_use" => {
                let block = &event["content_block"];
                self.tools.insert(
                    index,
                    PendingToolCall {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        input_json: String::new(),
                    },
                );
                Ok(None)
            }
            Some("content_block_delta") => match event["delta"]["type"].as_str() {
                Some("text_delta") => Ok(event["delta"]["text"]
                    .as_str()
                    .map(AgentEvent::stdout)),
                Some("input_json_delta") => {
                    if let (Some(tool), Some(partial)) = (
                        self.tools.get_mut(&index),
                        event["delta"]["partial_json"].as_str(),
                    ) {
                        tool.input_json.push_str(partial);
                    }
                    Ok(None)
                }
                _ => Ok(None),
            },
            Some("content_block_stop") => match self.tools.remove(&index) {
                Some(tool) => {
                    let input = if tool.input_json.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&tool.input_json)?
                    };
                    Ok(Some(AgentEvent::ToolCall {
                        id: tool.id,
                        name: tool.name,
                        input,
                    }))
                }
                None => Ok(None),
            },
            Some("message_delta") => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                Ok(None)
            }
            Some("error") => Err(RunnerError::Api(
                event["error"]["message"]
                    .as_str()
                    .unwrap_or("Unknown streaming error")
                    .to_string(),
            )),
            _ => Ok(None),
        }
    }
}

/// Locate the blank line ending the first event in `buffer`.
///
/// Returns where the event's text ends and where the next event starts.
/// Lines may end in LF, CRLF or a lone CR.
fn event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    let mut i = 0;
    while i < buffer.len() {
        let terminator = match buffer[i] {
            b'\n' => 1,
            b'\r' => match buffer.get(i + 1) {
                Some(b'\n') => 2,
                Some(_) => 1,
                // The LF of a CRLF may still be in flight
                None => return None,
            },
            _ => {
                i += 1;
                continue;
            }
        };
        if i == line_start {
            return Some((line_start, i + terminator));
        }
        i += terminator;
        line_start = i;
    }
    None
}

/// Split complete SSE events off the front of `buffer` and decode their data.
///
/// Events are only decoded as text once whole, so a character split across
/// network chunks survives intact.
fn drain_sse_events(buffer: &mut Vec<u8>) -> Vec<Value> {
    let mut decoded = Vec::new();
    while let Some((event_end, next_start)) = event_boundary(buffer) {
        let event: Vec<u8> = buffer.drain(..next_start).take(event_end).collect();
        let text = String::from_utf8_lossy(&event);

        let data: Vec<&str> = text
            .split(['\r', '\n'])
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect();
        if data.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&data.join("\n")) {
            Ok(value) => decoded.push(value),
            Err(e) => debug!("Skipping undecodable stream event: {}", e),
        }
    }
    decoded
}

#[async_trait]
impl AgentBackend for SdkBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sdk
    }

    async fn run(&self, request: &AgentRequest, ctx: &RunContext) -> Result<RunOutcome> {
        let api_key = request
            .env
            .get(API_KEY_VAR)
            .or(self.config.api_key.as_ref())
            .ok_or(RunnerError::MissingApiKey)?;
        let model = request.model.as_deref().unwrap_or(&self.config.model);

        let body = MessagesRequest {
            model,
            max_tokens: self.config.max_tokens,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
            stream: true,
        };

        info!("Making Anthropic API streaming request: model={}", model);
        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url.trim_end_matches('/')))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Anthropic API error: {} - {}", status, error_text);
            return Err(RunnerError::Api(format!(
                "API returned {}: {}",
                status, error_text
            )));
        }

        let mut byte_stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut state = StreamState::default();

        loop {
            let chunk = tokio::select! {
                chunk = byte_stream.next() => chunk,
                _ = ctx.cancelled() => return Ok(RunOutcome::cancelled()),
            };
            let Some(chunk) = chunk else { break };
            buffer.extend_from_slice(&chunk?);

            for event in drain_sse_events(&mut buffer) {
                if let Some(agent_event) = state.apply(&event)? {
                    ctx.emit(agent_event).await?;
                }
            }
        }

        debug!(stop_reason = ?state.stop_reason, "Anthropic stream finished");
        match state.stop_reason.as_deref() {
            Some("max_tokens") => Ok(RunOutcome::failed(None, "response hit the token limit")),
            Some("refusal") => Ok(RunOutcome::failed(None, "model refused the request")),
            _ => Ok(RunOutcome::completed(None)),
        }
    }
}
