// ABOUTME: Normalized agent runner events shared by every backend
// ABOUTME: Serialized as one JSON object per line with a `type` tag

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical shape of one selectable prompt answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptOption {
    pub id: String,
    pub label: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    Stdout {
        text: String,
    },
    Stderr {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Prompt {
        id: String,
        message: String,
        options: Vec<PromptOption>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },
    PromptAnswered {
        prompt_id: String,
        option_id: String,
    },
    Status {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl AgentEvent {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::Stdout { text: text.into() }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::Stderr { text: text.into() }
    }

    pub fn status(status: RunStatus, exit_code: Option<i32>, message: Option<String>) -> Self {
        Self::Status {
            status,
            exit_code,
            message,
        }
    }

    /// Terminal status carried by this event, if any
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self {
            Self::Status { status, .. } if status.is_terminal() => Some(*status),
            _ => None,
        }
    }

    /// Encode as a single line without the trailing newline
    pub fn to_line(&self) -> String {
        // Serializing a plain enum of strings and JSON values cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_line(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

/// Message sent to a running agent process on stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RunnerInput {
    Answer { prompt_id: String, option_id: String },
    Cancel,
}
