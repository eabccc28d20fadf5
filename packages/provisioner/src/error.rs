// ABOUTME: Error types for provisioning and task execution
// ABOUTME: Setup failures are hard errors; command failures are reported through results instead

use hatchery_core::StoreError;
use hatchery_sandbox::{ExecOutput, ManagerError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Environment setup failed: {message}")]
    Setup {
        message: String,
        /// Full output of the failed command
        output: Option<String>,
    },

    #[error("Task {0} is not pending")]
    NotPending(String),

    #[error("Invalid task config: {0}")]
    InvalidConfig(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] ManagerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl ProvisionError {
    pub(crate) fn setup_command(message: impl Into<String>, output: &ExecOutput) -> Self {
        Self::Setup {
            message: message.into(),
            output: Some(output.output.clone()).filter(|o| !o.is_empty()),
        }
    }

    /// Command output behind the error, when a command failed
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Setup { output, .. } => output.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
