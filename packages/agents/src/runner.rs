// ABOUTME: Agent runner dispatcher mapping a request's backend to one implementation
// ABOUTME: Wraps every run in a started status and exactly one terminal status

use crate::events::{AgentEvent, PromptOption, RunStatus};
use crate::options::normalize_options;
use crate::prompts::{AnswerError, PromptTracker};
use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Backend {backend} does not support agent {agent}")]
    UnsupportedAgent { backend: BackendKind, agent: String },

    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No API key configured for the SDK backend")]
    MissingApiKey,

    #[error("API error: {0}")]
    Api(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Event consumer went away")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Cli,
    Sdk,
    Acp,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Sdk => "sdk",
            Self::Acp => "acp",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cli" | "direct" | "shell" => Ok(Self::Cli),
            "sdk" => Ok(Self::Sdk),
            "acp" | "agent-protocol" => Ok(Self::Acp),
            other => Err(RunnerError::UnknownBackend(other.to_string())),
        }
    }
}

/// One agent invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub backend: BackendKind,
    pub agent: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Extra process environment, usually API keys
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl AgentRequest {
    pub fn new(backend: BackendKind, agent: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            backend,
            agent: agent.into(),
            prompt: prompt.into(),
            model: None,
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

/// How a backend finished; the dispatcher turns this into the terminal status event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

impl RunOutcome {
    pub fn completed(exit_code: Option<i32>) -> Self {
        Self {
            status: RunStatus::Completed,
            exit_code,
            message: None,
        }
    }

    pub fn failed(exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            exit_code,
            message: Some(message.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            exit_code: None,
            message: None,
        }
    }

    fn into_event(self) -> AgentEvent {
        AgentEvent::status(self.status, self.exit_code, self.message)
    }
}

/// Per-run handle given to a backend for emitting events and asking questions
pub struct RunContext {
    events: mpsc::Sender<AgentEvent>,
    prompts: Arc<PromptTracker>,
    cancel: CancellationToken,
    prompt_timeout: Option<Duration>,
}

impl RunContext {
    pub fn new(
        events: mpsc::Sender<AgentEvent>,
        prompts: Arc<PromptTracker>,
        cancel: CancellationToken,
        prompt_timeout: Option<Duration>,
    ) -> Self {
        Self {
            events,
            prompts,
            cancel,
            prompt_timeout,
        }
    }

    pub async fn emit(&self, event: AgentEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| RunnerError::ChannelClosed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Emit a prompt built from free-form options and wait for its answer.
    ///
    /// Returns `Ok(None)` when the prompt expires unanswered and
    /// `Err(Cancelled)` when the run is cancelled while waiting.
    pub async fn ask(&self, message: impl Into<String>, raw_options: &Value) -> Result<Option<PromptOption>> {
        let options = normalize_options(raw_options);
        if options.is_empty() {
            return Err(RunnerError::Protocol(
                "prompt carried no usable options".to_string(),
            ));
        }

        let prompt_id = uuid::Uuid::new_v4().to_string();
        // Both clocks are read once, before the prompt can be delayed by a full channel
        let asked_at = (Instant::now(), Utc::now());
        let deadline = self.prompt_timeout.and_then(|timeout| {
            let wall = chrono::Duration::from_std(timeout).ok()?;
            Some((asked_at.0 + timeout, asked_at.1 + wall))
        });
        let expires_at = deadline.map(|(_, wall)| wall);

        // Register before emitting so an immediate answer is never "unknown"
        let mut answer = self
            .prompts
            .register(prompt_id.clone(), options.clone(), expires_at);
        self.emit(AgentEvent::Prompt {
            id: prompt_id.clone(),
            message: message.into(),
            options,
            expires_at,
        })
        .await?;

        let expiry = async {
            match deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let accepted = tokio::select! {
            answered = &mut answer => answered.ok(),
            _ = expiry => {
                if self.prompts.expire(&prompt_id) {
                    debug!(prompt_id = %prompt_id, "Prompt expired unanswered");
                    None
                } else {
                    (&mut answer).await.ok()
                }
            }
            _ = self.cancel.cancelled() => return Err(RunnerError::Cancelled),
        };

        let Some(option) = accepted else {
            return Ok(None);
        };
        self.emit(AgentEvent::PromptAnswered {
            prompt_id,
            option_id: option.id.clone(),
        })
        .await?;
        Ok(Some(option))
    }
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run the agent to completion, emitting events through `ctx`.
    ///
    /// Implementations must not emit `status` events themselves.
    async fn run(&self, request: &AgentRequest, ctx: &RunContext) -> Result<RunOutcome>;
}

/// Registry of backends keyed by kind
pub struct AgentRunner {
    backends: HashMap<BackendKind, Arc<dyn AgentBackend>>,
    prompt_timeout: Option<Duration>,
}

impl Default for AgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRunner {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            prompt_timeout: Some(DEFAULT_PROMPT_TIMEOUT),
        }
    }

    pub fn register(mut self, backend: Arc<dyn AgentBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    /// How long prompts stay answerable; `None` waits forever
    pub fn with_prompt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    pub fn backend(&self, kind: BackendKind) -> Option<Arc<dyn AgentBackend>> {
        self.backends.get(&kind).cloned()
    }

    /// Start a run in the background and return its handle
    pub fn start(&self, request: AgentRequest) -> Result<RunHandle> {
        let backend = self
            .backend(request.backend)
            .ok_or_else(|| RunnerError::UnknownBackend(request.backend.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let prompts = Arc::new(PromptTracker::new());
        let cancel = CancellationToken::new();
        let ctx = RunContext::new(tx, prompts.clone(), cancel.clone(), self.prompt_timeout);

        tokio::spawn(async move {
            info!(backend = %request.backend, agent = %request.agent, "Starting agent run");
            if ctx
                .emit(AgentEvent::status(RunStatus::Started, None, None))
                .await
                .is_err()
            {
                return;
            }

            let outcome = match backend.run(&request, &ctx).await {
                Ok(outcome) => outcome,
                Err(RunnerError::Cancelled) => RunOutcome::cancelled(),
                Err(RunnerError::ChannelClosed) => {
                    debug!("Event consumer dropped, abandoning run");
                    return;
                }
                Err(e) => {
                    warn!(backend = %request.backend, error = %e, "Agent run failed");
                    RunOutcome::failed(None, e.to_string())
                }
            };
            // A cancelled run reports cancelled even if the backend raced to another outcome
            let outcome = if ctx.is_cancelled() && outcome.status != RunStatus::Failed {
                RunOutcome {
                    status: RunStatus::Cancelled,
                    ..outcome
                }
            } else {
                outcome
            };

            info!(backend = %request.backend, status = ?outcome.status, "Agent run finished");
            let _ = ctx.emit(outcome.into_event()).await;
        });

        Ok(RunHandle {
            events: rx,
            prompts,
            cancel,
        })
    }
}

/// Consumer side of a run. Dropping it cancels the run.
pub struct RunHandle {
    events: mpsc::Receiver<AgentEvent>,
    prompts: Arc<PromptTracker>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Next event in backend order; `None` once the terminal status has been delivered
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    pub fn answer(&self, prompt_id: &str, option_id: &str) -> std::result::Result<PromptOption, AnswerError> {
        self.prompts.answer(prompt_id, option_id)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this run, for handing to input readers
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn prompts(&self) -> Arc<PromptTracker> {
        self.prompts.clone()
    }

    pub fn into_stream(self) -> impl Stream<Item = AgentEvent> {
        async_stream::stream! {
            let mut handle = self;
            while let Some(event) = handle.next_event().await {
                yield event;
            }
        }
    }

    /// Drain every remaining event
    pub async fn collect(mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
