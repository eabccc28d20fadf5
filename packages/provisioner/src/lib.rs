// ABOUTME: Provisions sandboxes for agent runs: tool installs, repository checkout and agent execution
// ABOUTME: Works through any container provider's exec channel, local or remote

pub mod config;
pub mod error;
pub mod execute;
pub mod executor;
pub mod install;
pub mod provisioner;
pub mod setup;

pub use config::{agent_tool, AgentTool, ProvisionerConfig, AGENT_TOOLS};
pub use error::{ProvisionError, Result};
pub use execute::{parse_runner_output, AgentTaskRequest, AgentTaskResult, ToolCallRecord};
pub use executor::{TaskExecutor, TaskRunConfig};
pub use install::{InstallReport, InstallResult};
pub use provisioner::{synopsis, CliProvisioner};
pub use setup::SetupResult;
