// ABOUTME: Drives one queued task end to end on a provider: claim, sandbox, install, checkout, run, record
// ABOUTME: Every failure after the claim is written back to the task instead of being lost

use crate::config::ProvisionerConfig;
use crate::error::{ProvisionError, Result};
use crate::execute::AgentTaskRequest;
use crate::provisioner::CliProvisioner;
use hatchery_agents::BackendKind;
use hatchery_core::{ResourceLimits, Store, StoreError, Task, TaskStatus};
use hatchery_sandbox::{ContainerProvider, CreateSandboxRequest, SandboxManager};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Run parameters carried in a task's config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunConfig {
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub agent: String,
    pub prompt: String,
    /// Runner backend name; absent means the tool is run directly
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_count: Option<f64>,
}

impl TaskRunConfig {
    pub fn from_task(task: &Task) -> Result<Self> {
        let config: Self = serde_json::from_value(task.config.clone())
            .map_err(|e| ProvisionError::InvalidConfig(e.to_string()))?;
        for (field, value) in [
            ("repoUrl", &config.repo_url),
            ("agent", &config.agent),
            ("prompt", &config.prompt),
        ] {
            if value.trim().is_empty() {
                return Err(ProvisionError::InvalidConfig(format!("{} must not be empty", field)));
            }
        }
        config.backend_kind()?;
        Ok(config)
    }

    pub fn backend_kind(&self) -> Result<Option<BackendKind>> {
        self.backend
            .as_deref()
            .map(str::parse::<BackendKind>)
            .transpose()
            .map_err(|e| ProvisionError::InvalidConfig(e.to_string()))
    }

    pub fn limits(&self) -> ResourceLimits {
        let defaults = ResourceLimits::default();
        ResourceLimits {
            memory_bytes: self.memory_bytes.unwrap_or(defaults.memory_bytes),
            cpu_count: self.cpu_count.unwrap_or(defaults.cpu_count),
        }
    }
}

/// Final fields written back to the task
#[derive(Debug, Default)]
struct Finish {
    success: bool,
    output: Option<String>,
    raw_output: Option<String>,
    exit_code: Option<i64>,
    error_message: Option<String>,
    config_patch: Map<String, Value>,
}

impl Finish {
    fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    fn with_output(mut self, output: String) -> Self {
        if !output.is_empty() {
            self.output = Some(output);
        }
        self
    }
}

pub struct TaskExecutor {
    store: Arc<dyn Store>,
    config: ProvisionerConfig,
}

impl TaskExecutor {
    pub fn new(store: Arc<dyn Store>, config: ProvisionerConfig) -> Self {
        Self { store, config }
    }

    /// Run a pending task to completion.
    ///
    /// The task is claimed with its current version so two executors cannot
    /// both run it. Secrets are handed to the agent exec only and never stored.
    pub async fn run(
        &self,
        task_id: &str,
        provider: Arc<dyn ContainerProvider>,
        secrets: HashMap<String, String>,
    ) -> Result<Task> {
        let task = self.store.get_task(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(ProvisionError::NotPending(task_id.to_string()));
        }

        let expected = task.version;
        let mut claimed = task;
        claimed.status = TaskStatus::Running;
        let mut task = match self.store.update_task(claimed, Some(expected)).await {
            Ok(task) => task,
            Err(StoreError::VersionConflict { .. }) => {
                return Err(ProvisionError::NotPending(task_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        info!(task_id = %task.id, target_id = %task.target_id, "Task claimed");

        let manager = SandboxManager::new(self.store.clone(), provider.clone());
        let finish = self.drive(&mut task, &manager, provider, secrets).await;

        if let Some(sandbox_id) = task.sandbox_id.clone() {
            if let Err(e) = manager.stop_sandbox(&sandbox_id).await {
                warn!(task_id = %task.id, sandbox_id = %sandbox_id, "Failed to stop sandbox: {}", e);
            }
        }

        self.finish(task, finish).await
    }

    async fn drive(
        &self,
        task: &mut Task,
        manager: &SandboxManager,
        provider: Arc<dyn ContainerProvider>,
        secrets: HashMap<String, String>,
    ) -> Finish {
        let run_config = match TaskRunConfig::from_task(task) {
            Ok(config) => config,
            Err(e) => return Finish::error(e.to_string()),
        };
        // Validated by from_task
        let backend = run_config.backend_kind().ok().flatten();

        let sandbox = match manager
            .create_sandbox(CreateSandboxRequest {
                target_id: task.target_id.clone(),
                image: run_config.image.clone(),
                env: HashMap::new(),
                limits: run_config.limits(),
            })
            .await
        {
            Ok(sandbox) => sandbox,
            Err(e) => return Finish::error(format!("Sandbox creation failed: {}", e)),
        };
        let Some(container_id) = sandbox.container_id.clone() else {
            return Finish::error(format!("Sandbox {} has no container", sandbox.id));
        };

        task.sandbox_id = Some(sandbox.id.clone());
        task.container_id = Some(container_id.clone());
        match self.store.update_task(task.clone(), Some(task.version)).await {
            Ok(updated) => *task = updated,
            Err(e) => warn!(task_id = %task.id, "Failed to record sandbox on task: {}", e),
        }

        let provisioner = CliProvisioner::new(provider, container_id, self.config.clone());

        let report = match provisioner.install_for(&run_config.agent, backend).await {
            Ok(report) => report,
            Err(e) => return Finish::error(e.to_string()),
        };
        if let Some((step, message)) = report.failure() {
            return Finish::error(format!("Installing {} failed: {}", step, message))
                .with_output(report.output());
        }

        let setup = match provisioner
            .setup_environment(&run_config.repo_url, run_config.branch.as_deref())
            .await
        {
            Ok(setup) => setup,
            Err(e) => {
                let output = e.output().unwrap_or_default().to_string();
                return Finish::error(e.to_string()).with_output(output);
            }
        };

        let mut config_patch = Map::new();
        config_patch.insert("branch".to_string(), json!(setup.branch));
        if let Some(commit) = &setup.commit {
            config_patch.insert("commit".to_string(), json!(commit));
        }

        let request = AgentTaskRequest {
            agent: run_config.agent.clone(),
            prompt: run_config.prompt.clone(),
            model: run_config.model.clone(),
            backend,
            secrets,
        };
        let result = match provisioner.execute_agent_task(&request).await {
            Ok(result) => result,
            Err(e) => {
                let mut finish = Finish::error(e.to_string());
                finish.config_patch = config_patch;
                return finish;
            }
        };

        if !result.tool_calls.is_empty() {
            config_patch.insert("toolCalls".to_string(), json!(result.tool_calls));
        }
        let raw_output = (result.raw_output != result.output).then_some(result.raw_output);
        Finish {
            success: result.success,
            output: Some(result.output),
            raw_output,
            exit_code: Some(result.exit_code),
            error_message: result.error_message,
            config_patch,
        }
    }

    async fn finish(&self, mut task: Task, finish: Finish) -> Result<Task> {
        task.status = if finish.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Error
        };
        task.output = finish.output;
        task.raw_output = finish.raw_output;
        task.exit_code = finish.exit_code;
        task.error_message = finish.error_message;
        task.merge_config(&Value::Object(finish.config_patch));

        if let Some(message) = &task.error_message {
            error!(task_id = %task.id, "Task failed: {}", message);
        } else {
            info!(task_id = %task.id, exit_code = ?task.exit_code, "Task completed");
        }

        let expected = task.version;
        let task_id = task.id.clone();
        match self.store.update_task(task, Some(expected)).await {
            Ok(task) => Ok(task),
            Err(StoreError::VersionConflict { .. }) => {
                warn!(task_id = %task_id, "Task changed while running; keeping the stored record");
                Ok(self.store.get_task(&task_id).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_from_task() {
        let task = Task::new(
            "target-1",
            "user-1",
            json!({
                "repoUrl": "https://github.com/acme/widgets.git",
                "agent": "claude",
                "prompt": "fix the flaky test",
                "backend": "agent-protocol",
                "memoryBytes": 1024
            }),
        );
        let config = TaskRunConfig::from_task(&task).unwrap();
        assert_eq!(config.backend_kind().unwrap(), Some(BackendKind::Acp));
        assert_eq!(config.limits().memory_bytes, 1024);
        assert_eq!(config.limits().cpu_count, ResourceLimits::default().cpu_count);
    }

    #[test]
    fn test_run_config_rejects_missing_fields() {
        let task = Task::new("t", "u", json!({"repoUrl": "x", "agent": "claude"}));
        assert!(matches!(
            TaskRunConfig::from_task(&task),
            Err(ProvisionError::InvalidConfig(_))
        ));

        let task = Task::new(
            "t",
            "u",
            json!({"repoUrl": "x", "agent": "claude", "prompt": "go", "backend": "telepathy"}),
        );
        assert!(matches!(
            TaskRunConfig::from_task(&task),
            Err(ProvisionError::InvalidConfig(_))
        ));
    }
}
