// ABOUTME: Sandbox lifecycle manager orchestrating the store and a container provider
// ABOUTME: Drives sandbox status transitions and keeps container and volume ids on the record

use crate::providers::{ContainerInspection, ContainerProvider, ContainerSpec, ContainerStatus, ProviderError};
use hatchery_core::{ResourceLimits, Sandbox, SandboxStatus, Store, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Sandbox {0} has no container")]
    NoContainer(String),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// Request to create and start a new sandbox
#[derive(Debug, Clone, Default)]
pub struct CreateSandboxRequest {
    pub target_id: String,
    pub image: Option<String>,
    pub env: HashMap<String, String>,
    pub limits: ResourceLimits,
}

/// Sandbox record together with what the backend currently reports
#[derive(Debug, Clone)]
pub struct SandboxInspection {
    pub sandbox: Sandbox,
    pub container: ContainerInspection,
}

/// Sandbox lifecycle manager bound to one provider
pub struct SandboxManager {
    store: Arc<dyn Store>,
    provider: Arc<dyn ContainerProvider>,
}

impl SandboxManager {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn ContainerProvider>) -> Self {
        Self { store, provider }
    }

    pub fn provider(&self) -> &Arc<dyn ContainerProvider> {
        &self.provider
    }

    async fn set_status(
        &self,
        mut sandbox: Sandbox,
        status: SandboxStatus,
        error: Option<String>,
    ) -> Result<Sandbox> {
        sandbox.status = status;
        sandbox.error_message = error;
        Ok(self.store.update_sandbox(sandbox).await?)
    }

    fn container_id(sandbox: &Sandbox) -> Result<String> {
        sandbox
            .container_id
            .clone()
            .ok_or_else(|| ManagerError::NoContainer(sandbox.id.clone()))
    }

    /// Create the sandbox record, its compute unit and volume, then start it.
    ///
    /// Provider failures leave the record in `error` with the message kept.
    pub async fn create_sandbox(&self, request: CreateSandboxRequest) -> Result<Sandbox> {
        let sandbox = self
            .store
            .create_sandbox(Sandbox::new(request.target_id.clone(), request.limits))
            .await?;
        info!(sandbox_id = %sandbox.id, target_id = %sandbox.target_id, "Creating sandbox");

        let mut spec = ContainerSpec {
            env: request.env,
            limits: request.limits,
            ..Default::default()
        };
        if let Some(image) = request.image {
            spec.image = image;
        }

        let created = match self.provider.create_container(&sandbox.id, &spec).await {
            Ok(created) => created,
            Err(e) => {
                self.set_status(sandbox, SandboxStatus::Error, Some(e.to_string()))
                    .await?;
                return Err(e.into());
            }
        };

        let mut sandbox = sandbox;
        sandbox.container_id = Some(created.container_id);
        sandbox.volume_id = Some(created.volume_id);
        let sandbox = self.set_status(sandbox, SandboxStatus::Starting, None).await?;

        self.run_start(sandbox).await
    }

    async fn run_start(&self, sandbox: Sandbox) -> Result<Sandbox> {
        let container_id = Self::container_id(&sandbox)?;
        match self.provider.start_container(&container_id).await {
            Ok(()) => {
                info!(sandbox_id = %sandbox.id, "Sandbox running");
                self.set_status(sandbox, SandboxStatus::Running, None).await
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox.id, "Failed to start sandbox: {}", e);
                self.set_status(sandbox, SandboxStatus::Error, Some(e.to_string()))
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Start a stopped sandbox; starting a running one is a no-op
    pub async fn start_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        let sandbox = self.store.get_sandbox(sandbox_id).await?;
        match sandbox.status {
            SandboxStatus::Running => Ok(sandbox),
            SandboxStatus::Stopped | SandboxStatus::Error => {
                let sandbox = self.set_status(sandbox, SandboxStatus::Starting, None).await?;
                self.run_start(sandbox).await
            }
            other => Err(ManagerError::InvalidStateTransition(format!(
                "Cannot start sandbox in state {}",
                other.as_str()
            ))),
        }
    }

    /// Stop a running sandbox; stopping a stopped one is a no-op
    pub async fn stop_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        let sandbox = self.store.get_sandbox(sandbox_id).await?;
        if sandbox.status == SandboxStatus::Stopped {
            return Ok(sandbox);
        }

        let container_id = Self::container_id(&sandbox)?;
        let sandbox = self.set_status(sandbox, SandboxStatus::Stopping, None).await?;

        match self.provider.stop_container(&container_id).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => {
                info!(sandbox_id = %sandbox.id, "Sandbox stopped");
                self.set_status(sandbox, SandboxStatus::Stopped, None).await
            }
            Err(e) => {
                self.set_status(sandbox, SandboxStatus::Error, Some(e.to_string()))
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Remove the compute unit and, unless preserved, the volume.
    ///
    /// The record stays as `stopped` with its container id cleared.
    pub async fn remove_sandbox(&self, sandbox_id: &str, preserve_volume: bool) -> Result<Sandbox> {
        let mut sandbox = self.store.get_sandbox(sandbox_id).await?;

        if let Some(container_id) = &sandbox.container_id {
            self.provider
                .remove_container(container_id, sandbox.volume_id.as_deref(), preserve_volume)
                .await?;
        }

        info!(sandbox_id = %sandbox.id, preserve_volume, "Sandbox removed");
        sandbox.container_id = None;
        if !preserve_volume {
            sandbox.volume_id = None;
        }
        self.set_status(sandbox, SandboxStatus::Stopped, None).await
    }

    /// Inspect the backend unit and reconcile the record with what it reports
    pub async fn inspect_sandbox(&self, sandbox_id: &str) -> Result<SandboxInspection> {
        let sandbox = self.store.get_sandbox(sandbox_id).await?;
        let Some(container_id) = sandbox.container_id.clone() else {
            return Ok(SandboxInspection {
                sandbox,
                container: ContainerInspection::not_found(),
            });
        };

        let container = self.provider.inspect_container(&container_id).await?;

        let observed = match container.status {
            ContainerStatus::Running => SandboxStatus::Running,
            ContainerStatus::Stopped | ContainerStatus::NotFound => SandboxStatus::Stopped,
            ContainerStatus::Created => sandbox.status,
        };
        let sandbox = if observed != sandbox.status
            && matches!(sandbox.status, SandboxStatus::Running | SandboxStatus::Stopped)
        {
            info!(
                sandbox_id = %sandbox.id,
                from = sandbox.status.as_str(),
                to = observed.as_str(),
                "Reconciling sandbox status with backend"
            );
            self.set_status(sandbox, observed, container.message.clone())
                .await?
        } else {
            sandbox
        };

        Ok(SandboxInspection { sandbox, container })
    }

    /// Ids of sandboxes on `target_id` that still own a volume
    pub async fn volume_owners(&self, target_id: &str) -> Result<HashSet<String>> {
        Ok(self
            .store
            .list_sandboxes(Some(target_id))
            .await?
            .into_iter()
            .filter(|s| s.volume_id.is_some())
            .map(|s| s.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryProvider;
    use hatchery_core::MemoryStore;

    fn manager() -> (SandboxManager, Arc<InMemoryProvider>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(InMemoryProvider::new());
        (
            SandboxManager::new(store.clone(), provider.clone()),
            provider,
            store,
        )
    }

    fn request() -> CreateSandboxRequest {
        CreateSandboxRequest {
            target_id: "target-1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_runs_sandbox_and_records_ids() {
        let (manager, provider, _) = manager();
        let sandbox = manager.create_sandbox(request()).await.unwrap();

        assert_eq!(sandbox.status, SandboxStatus::Running);
        let container_id = sandbox.container_id.clone().unwrap();
        assert_eq!(container_id, format!("hatchery-{}", sandbox.id.to_lowercase()));
        assert_eq!(
            sandbox.volume_id.as_deref(),
            Some(format!("hatchery-vol-{}", sandbox.id.to_lowercase()).as_str())
        );
        assert_eq!(provider.status_of(&container_id), ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_and_start_are_idempotent() {
        let (manager, _, _) = manager();
        let sandbox = manager.create_sandbox(request()).await.unwrap();

        let stopped = manager.stop_sandbox(&sandbox.id).await.unwrap();
        assert_eq!(stopped.status, SandboxStatus::Stopped);
        let again = manager.stop_sandbox(&sandbox.id).await.unwrap();
        assert_eq!(again.status, SandboxStatus::Stopped);

        let running = manager.start_sandbox(&sandbox.id).await.unwrap();
        assert_eq!(running.status, SandboxStatus::Running);
        let again = manager.start_sandbox(&sandbox.id).await.unwrap();
        assert_eq!(again.status, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn test_remove_then_inspect_is_not_found() {
        let (manager, provider, _) = manager();
        let sandbox = manager.create_sandbox(request()).await.unwrap();
        let volume = sandbox.volume_id.clone().unwrap();

        let removed = manager.remove_sandbox(&sandbox.id, false).await.unwrap();
        assert_eq!(removed.status, SandboxStatus::Stopped);
        assert!(removed.container_id.is_none());
        assert!(!provider.has_volume(&volume));

        let inspection = manager.inspect_sandbox(&sandbox.id).await.unwrap();
        assert_eq!(inspection.container.status, ContainerStatus::NotFound);
    }

    #[tokio::test]
    async fn test_remove_preserving_volume_keeps_owner() {
        let (manager, provider, _) = manager();
        let sandbox = manager.create_sandbox(request()).await.unwrap();
        let volume = sandbox.volume_id.clone().unwrap();

        manager.remove_sandbox(&sandbox.id, true).await.unwrap();
        assert!(provider.has_volume(&volume));

        let owners = manager.volume_owners("target-1").await.unwrap();
        assert!(owners.contains(&sandbox.id));
    }

    #[tokio::test]
    async fn test_inspect_reconciles_vanished_unit() {
        let (manager, provider, _) = manager();
        let sandbox = manager.create_sandbox(request()).await.unwrap();
        let container_id = sandbox.container_id.clone().unwrap();

        // Unit removed behind the manager's back
        provider.remove_container(&container_id, None, true).await.unwrap();

        let inspection = manager.inspect_sandbox(&sandbox.id).await.unwrap();
        assert_eq!(inspection.sandbox.status, SandboxStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_failure_marks_error() {
        let (manager, provider, store) = manager();
        let sandbox = manager.create_sandbox(request()).await.unwrap();
        manager.stop_sandbox(&sandbox.id).await.unwrap();
        provider
            .remove_container(sandbox.container_id.as_deref().unwrap(), None, true)
            .await
            .unwrap();

        let err = manager.start_sandbox(&sandbox.id).await.unwrap_err();
        assert!(matches!(err, ManagerError::Provider(ProviderError::NotFound(_))));

        let stored = store.get_sandbox(&sandbox.id).await.unwrap();
        assert_eq!(stored.status, SandboxStatus::Error);
        assert!(stored.error_message.is_some());
    }
}
