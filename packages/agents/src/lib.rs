// ABOUTME: Agent runner normalizing CLI, SDK and agent-protocol runs into one event stream
// ABOUTME: Includes prompt option normalization and single-answer prompt tracking

pub mod backends;
pub mod events;
pub mod options;
pub mod prompts;
pub mod runner;

use std::sync::Arc;

pub use backends::{AcpBackend, AgentCommand, CliBackend, SdkBackend, SdkConfig};
pub use events::{AgentEvent, PromptOption, RunStatus, RunnerInput};
pub use options::normalize_options;
pub use prompts::{AnswerError, PromptTracker};
pub use runner::{
    AgentBackend, AgentRequest, AgentRunner, BackendKind, RunContext, RunHandle, RunOutcome,
    RunnerError,
};

/// Runner with all three backends registered
pub fn default_runner(sdk: SdkConfig) -> runner::Result<AgentRunner> {
    Ok(AgentRunner::new()
        .register(Arc::new(CliBackend::new()))
        .register(Arc::new(SdkBackend::new(sdk)?))
        .register(Arc::new(AcpBackend::new())))
}
