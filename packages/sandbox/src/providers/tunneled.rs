// ABOUTME: Docker provider reached through an SSH tunnel to a remote daemon socket
// ABOUTME: Wraps DockerProvider behind an explicit connection state rebuilt whenever the tunnel port changes

use super::{
    ContainerInspection, ContainerProvider, ContainerSpec, ContainerSummary, CreatedContainer,
    DockerProvider, ExecOutput, HealthReport, ProviderError, Result, VolumeFilter, VolumeInfo,
};
use crate::tunnel::{SshTunnel, TunnelConfig, TunnelState};
use async_trait::async_trait;
use hatchery_core::TargetKind;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Connection to the remote daemon as seen by this provider
enum DockerLink {
    Disconnected,
    Connected {
        local_port: u16,
        docker: Arc<DockerProvider>,
    },
}

pub struct TunneledDockerProvider {
    tunnel: SshTunnel,
    link: RwLock<DockerLink>,
}

impl TunneledDockerProvider {
    /// Build the provider; the tunnel is opened lazily on first use
    pub fn new(config: TunnelConfig) -> Self {
        Self::with_tunnel(SshTunnel::new(config))
    }

    pub fn with_tunnel(tunnel: SshTunnel) -> Self {
        Self {
            tunnel,
            link: RwLock::new(DockerLink::Disconnected),
        }
    }

    pub fn tunnel(&self) -> &SshTunnel {
        &self.tunnel
    }

    /// Resolve a client bound to the tunnel's current local port
    async fn docker(&self) -> Result<Arc<DockerProvider>> {
        let local_port = match self.tunnel.state() {
            TunnelState::Connected { local_port } => local_port,
            TunnelState::Closed => {
                return Err(ProviderError::ConnectionError(
                    "SSH tunnel has been closed".to_string(),
                ))
            }
            TunnelState::Reconnecting { attempt, .. } => {
                return Err(ProviderError::ConnectionError(format!(
                    "SSH tunnel is reconnecting (attempt {})",
                    attempt
                )))
            }
            TunnelState::Disconnected | TunnelState::Connecting => self
                .tunnel
                .connect()
                .await
                .map_err(|e| ProviderError::ConnectionError(e.to_string()))?,
        };

        if let DockerLink::Connected {
            local_port: port,
            docker,
        } = &*self.link.read().await
        {
            if *port == local_port {
                return Ok(Arc::clone(docker));
            }
        }

        let mut link = self.link.write().await;
        if let DockerLink::Connected {
            local_port: port,
            docker,
        } = &*link
        {
            if *port == local_port {
                return Ok(Arc::clone(docker));
            }
        }

        debug!(local_port, "Binding Docker client to tunnel port");
        let docker = Arc::new(DockerProvider::forwarded(local_port)?);
        *link = DockerLink::Connected {
            local_port,
            docker: Arc::clone(&docker),
        };
        Ok(docker)
    }
}

impl Drop for TunneledDockerProvider {
    fn drop(&mut self) {
        self.tunnel.disconnect();
    }
}

#[async_trait]
impl ContainerProvider for TunneledDockerProvider {
    fn kind(&self) -> TargetKind {
        TargetKind::Tunneled
    }

    async fn health_check(&self) -> HealthReport {
        match self.docker().await {
            Ok(docker) => docker.health_check().await,
            Err(e) => HealthReport::unhealthy(e.to_string()),
        }
    }

    async fn create_container(
        &self,
        sandbox_id: &str,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer> {
        self.docker().await?.create_container(sandbox_id, spec).await
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker().await?.start_container(container_id).await
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.docker().await?.stop_container(container_id).await
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspection> {
        self.docker().await?.inspect_container(container_id).await
    }

    async fn get_logs(&self, container_id: &str, tail: Option<usize>) -> Result<String> {
        self.docker().await?.get_logs(container_id, tail).await
    }

    async fn remove_container(
        &self,
        container_id: &str,
        volume_id: Option<&str>,
        preserve_volume: bool,
    ) -> Result<()> {
        self.docker()
            .await?
            .remove_container(container_id, volume_id, preserve_volume)
            .await
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.docker().await?.list_containers().await
    }

    async fn execute_command(
        &self,
        container_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> ExecOutput {
        match self.docker().await {
            Ok(docker) => docker.execute_command(container_id, argv, env).await,
            Err(e) => ExecOutput::transport_failure(e),
        }
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<String> {
        self.docker().await?.create_volume(name, labels).await
    }

    async fn list_volumes(&self, filter: &VolumeFilter) -> Result<Vec<VolumeInfo>> {
        self.docker().await?.list_volumes(filter).await
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.docker().await?.delete_volume(name).await
    }

    async fn get_volume_size(&self, name: &str) -> Result<u64> {
        self.docker().await?.get_volume_size(name).await
    }

    async fn is_volume_in_use(&self, name: &str) -> Result<bool> {
        self.docker().await?.is_volume_in_use(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{BackoffPolicy, TunnelError, TunnelSession, TunnelTransport};
    use std::time::Duration;

    struct Unreachable;

    #[async_trait]
    impl TunnelTransport for Unreachable {
        async fn open_session(&self) -> crate::tunnel::Result<Arc<dyn TunnelSession>> {
            Err(TunnelError::Connect("no route to host".to_string()))
        }
    }

    fn unreachable_provider() -> TunneledDockerProvider {
        TunneledDockerProvider::with_tunnel(SshTunnel::with_transport(
            Arc::new(Unreachable),
            Duration::from_millis(200),
            BackoffPolicy::default(),
            None,
        ))
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_unhealthy() {
        let provider = unreachable_provider();
        let report = provider.health_check().await;
        assert!(!report.healthy);
        assert!(report.message.unwrap().contains("no route to host"));
    }

    #[tokio::test]
    async fn test_exec_over_dead_tunnel_is_synthetic_failure() {
        let provider = unreachable_provider();
        let out = provider
            .execute_command("abc", &["true".to_string()], &HashMap::new())
            .await;
        assert_eq!(out.exit_code, crate::providers::TRANSPORT_FAILURE_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_closed_tunnel_rejects_operations() {
        let provider = unreachable_provider();
        provider.tunnel().disconnect();

        let err = provider.start_container("abc").await.unwrap_err();
        assert!(matches!(err, ProviderError::ConnectionError(_)));
    }
}
