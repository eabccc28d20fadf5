// ABOUTME: Docker provider implementation for sandboxes on a container daemon
// ABOUTME: Uses bollard over a local socket or a forwarded TCP port to manage containers and volumes

use super::{
    sandbox_labels, volume_labels, ContainerInspection, ContainerProvider, ContainerSpec,
    ContainerStatus, ContainerSummary, CreatedContainer, ExecOutput, HealthReport, ProviderError,
    ResourceUsage, Result, VolumeFilter, VolumeInfo,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions},
    Docker, API_DEFAULT_VERSION,
};
use chrono::Utc;
use futures::StreamExt;
use hatchery_core::constants::{
    container_name, sandbox_id_from_container, volume_name, LABEL_MANAGED, LABEL_SANDBOX_ID,
    LABEL_VOLUME, WORKSPACE_DIR,
};
use hatchery_core::TargetKind;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds the daemon waits for a graceful stop before killing
const STOP_TIMEOUT_SECS: i64 = 10;

/// Client-side timeout passed to bollard for every request
const CLIENT_TIMEOUT_SECS: u64 = 120;

pub struct DockerProvider {
    client: Docker,
    kind: TargetKind,
    /// Bound on image pulls (default: 10 minutes)
    pull_timeout: Duration,
    /// Bound on the health check (default: 5 seconds)
    health_timeout: Duration,
}

impl DockerProvider {
    /// Connect to the daemon at its default local socket
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Connect to the daemon at a specific Unix socket path
    pub fn with_socket(path: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(path, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Connect to a daemon socket forwarded to a local TCP port
    pub fn forwarded(local_port: u16) -> Result<Self> {
        let addr = format!("tcp://127.0.0.1:{}", local_port);
        let client = Docker::connect_with_http(&addr, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        let mut provider = Self::with_client(client);
        provider.kind = TargetKind::Tunneled;
        Ok(provider)
    }

    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            kind: TargetKind::Direct,
            pull_timeout: Duration::from_secs(600),
            health_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Daemon version string, used in heartbeat stats
    pub async fn daemon_version(&self) -> Result<String> {
        let version = self
            .client
            .version()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    /// Convert a sandbox spec to bollard config with the volume mounted at the workspace
    fn to_bollard_config(
        &self,
        spec: &ContainerSpec,
        sandbox_id: &str,
        volume: &str,
    ) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.extend(sandbox_labels(sandbox_id, volume));

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = bollard::models::HostConfig {
            binds: Some(vec![format!("{}:{}:rw", volume, WORKSPACE_DIR)]),
            memory: Some(spec.limits.memory_bytes as i64),
            nano_cpus: Some((spec.limits.cpu_count * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.idle_command()),
            env: Some(env),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Map daemon state names onto the shared status vocabulary
    pub(crate) fn convert_status(state: &str) -> ContainerStatus {
        match state.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" | "restarting" | "paused" => ContainerStatus::Running,
            "exited" | "dead" | "removing" => ContainerStatus::Stopped,
            _ => ContainerStatus::Stopped,
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.client.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(ProviderError::ImageError(e.to_string())),
        }

        info!(image = %image, timeout = ?self.pull_timeout, "Pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    ProviderError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = info.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(result) => result,
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn usage(&self, container_id: &str) -> Option<ResourceUsage> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stats_stream = self.client.stats(container_id, Some(options));

        let stats = match stats_stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => {
                debug!(container_id = %container_id, "Stats unavailable: {}", e);
                return None;
            }
            None => return None,
        };

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));

        let cpu_percent = if system_delta > 0 && cpu_delta > 0 {
            (cpu_delta as f64 / system_delta as f64)
                * 100.0
                * stats.cpu_stats.online_cpus.unwrap_or(1) as f64
        } else {
            0.0
        };

        Some(ResourceUsage {
            cpu_percent,
            memory_bytes: stats.memory_stats.usage.unwrap_or(0),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
        })
    }

    async fn run_exec(
        &self,
        container_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> std::result::Result<ExecOutput, BollardError> {
        let env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let exec_config = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.client.create_exec(container_id, exec_config).await?;
        let start_result = self.client.start_exec(&exec.id, None).await?;

        let mut output = Vec::new();
        match start_result {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(msg) = stream.next().await {
                    match msg? {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message } => output.extend_from_slice(&message),
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Ok(ExecOutput::transport_failure("exec was detached unexpectedly"))
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        let text = String::from_utf8_lossy(&output).into_owned();

        Ok(match inspect.exit_code {
            Some(code) => ExecOutput::new(code, text),
            None => ExecOutput::new(super::TRANSPORT_FAILURE_EXIT_CODE, text),
        })
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

#[async_trait]
impl ContainerProvider for DockerProvider {
    fn kind(&self) -> TargetKind {
        self.kind
    }

    async fn health_check(&self) -> HealthReport {
        match tokio::time::timeout(self.health_timeout, self.client.version()).await {
            Ok(Ok(version)) => {
                HealthReport::healthy(version.version.unwrap_or_else(|| "unknown".to_string()))
            }
            Ok(Err(e)) => {
                warn!("Docker not available: {}", e);
                HealthReport::unhealthy(format!("Docker daemon unreachable: {}", e))
            }
            Err(_) => HealthReport::unhealthy(format!(
                "Docker daemon did not respond within {:?}",
                self.health_timeout
            )),
        }
    }

    async fn create_container(
        &self,
        sandbox_id: &str,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer> {
        let volume = volume_name(sandbox_id);
        let name = container_name(sandbox_id);
        info!(sandbox_id = %sandbox_id, container = %name, volume = %volume, "Creating container");

        self.create_volume(&volume, &volume_labels(sandbox_id)).await?;
        self.ensure_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let config = self.to_bollard_config(spec, sandbox_id, &volume);

        let container_id = match self.client.create_container(Some(options), config).await {
            Ok(created) => created.id,
            Err(e) if is_status(&e, 409) => {
                debug!(container = %name, "Container already exists, reusing");
                let existing = self
                    .client
                    .inspect_container(&name, None)
                    .await
                    .map_err(|e| ProviderError::ContainerError(e.to_string()))?;
                existing.id.unwrap_or(name)
            }
            Err(e) => return Err(ProviderError::ContainerError(e.to_string())),
        };

        Ok(CreatedContainer {
            container_id,
            volume_id: volume,
        })
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!(container_id = %container_id, "Starting container");

        match self
            .client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 304) => {
                debug!(container_id = %container_id, "Container already running");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Err(ProviderError::NotFound(container_id.to_string())),
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        info!(container_id = %container_id, "Stopping container");

        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 304) => {
                debug!(container_id = %container_id, "Container already stopped");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Err(ProviderError::NotFound(container_id.to_string())),
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspection> {
        let inspect = match self.client.inspect_container(container_id, None).await {
            Ok(inspect) => inspect,
            Err(e) if is_status(&e, 404) => return Ok(ContainerInspection::not_found()),
            Err(e) => return Err(ProviderError::ContainerError(e.to_string())),
        };

        let state = inspect.state.unwrap_or_default();
        let status = Self::convert_status(
            state
                .status
                .as_ref()
                .map(|s| s.as_ref())
                .unwrap_or("unknown"),
        );

        let started_at = state
            .started_at
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let usage = if status == ContainerStatus::Running {
            self.usage(container_id).await
        } else {
            None
        };

        Ok(ContainerInspection {
            status,
            started_at,
            uptime_secs: None,
            usage,
            exit_code: if status == ContainerStatus::Stopped {
                state.exit_code
            } else {
                None
            },
            message: state.error.filter(|e| !e.is_empty()),
        }
        .with_uptime(Utc::now()))
    }

    async fn get_logs(&self, container_id: &str, tail: Option<usize>) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.map(|n| n.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let mut stream = self.client.logs(container_id, Some(options));
        let mut logs = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => logs.extend_from_slice(&message),
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) if is_status(&e, 404) => {
                    return Err(ProviderError::NotFound(container_id.to_string()))
                }
                Err(e) => return Err(ProviderError::ContainerError(e.to_string())),
            }
        }

        Ok(String::from_utf8_lossy(&logs).into_owned())
    }

    async fn remove_container(
        &self,
        container_id: &str,
        volume_id: Option<&str>,
        preserve_volume: bool,
    ) -> Result<()> {
        info!(
            container_id = %container_id,
            preserve_volume,
            "Removing container"
        );

        let inspection = self.inspect_container(container_id).await?;
        if inspection.status == ContainerStatus::Running {
            match self.stop_container(container_id).await {
                Ok(()) | Err(ProviderError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if inspection.status != ContainerStatus::NotFound {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match self.client.remove_container(container_id, Some(options)).await {
                Ok(()) => {}
                Err(e) if is_status(&e, 404) => {}
                Err(e) => return Err(ProviderError::ContainerError(e.to_string())),
            }
        }

        if let (Some(volume), false) = (volume_id, preserve_volume) {
            if let Err(e) = self.delete_volume(volume).await {
                warn!(volume = %volume, "Failed to remove volume after container removal: {}", e);
            }
        }

        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let labels = c.labels.unwrap_or_default();
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                let sandbox_id = labels
                    .get(LABEL_SANDBOX_ID)
                    .cloned()
                    .or_else(|| sandbox_id_from_container(&name).map(str::to_string));
                Some(ContainerSummary {
                    status: Self::convert_status(c.state.as_deref().unwrap_or("unknown")),
                    sandbox_id,
                    volume: labels.get(LABEL_VOLUME).cloned(),
                    id,
                    name,
                })
            })
            .collect())
    }

    async fn execute_command(
        &self,
        container_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> ExecOutput {
        debug!(container_id = %container_id, command = ?argv.first(), "Executing command");

        match self.run_exec(container_id, argv, env).await {
            Ok(output) => output,
            Err(e) => {
                warn!(container_id = %container_id, "Exec transport failure: {}", e);
                ExecOutput::transport_failure(e)
            }
        }
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<String> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: "local".to_string(),
            labels: labels.clone(),
            ..Default::default()
        };

        match self.client.create_volume(options).await {
            Ok(volume) => Ok(volume.name),
            Err(e) if is_status(&e, 409) => Ok(name.to_string()),
            Err(e) => Err(ProviderError::VolumeError(e.to_string())),
        }
    }

    async fn list_volumes(&self, filter: &VolumeFilter) -> Result<Vec<VolumeInfo>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(prefix) = &filter.name_prefix {
            filters.insert("name".to_string(), vec![prefix.clone()]);
        }
        if !filter.labels.is_empty() {
            filters.insert(
                "label".to_string(),
                filter
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            );
        }

        let response = self
            .client
            .list_volumes(Some(ListVolumesOptions { filters }))
            .await
            .map_err(|e| ProviderError::VolumeError(e.to_string()))?;

        // The daemon's name filter is a substring match
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeInfo {
                name: v.name,
                labels: v.labels,
                created_at: v.created_at.map(|t| t.to_rfc3339()),
            })
            .filter(|v| filter.matches(v))
            .collect())
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        match self
            .client
            .remove_volume(name, Some(RemoveVolumeOptions { force: false }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) if is_status(&e, 409) => Err(ProviderError::VolumeInUse(name.to_string())),
            Err(e) => Err(ProviderError::VolumeError(e.to_string())),
        }
    }

    async fn get_volume_size(&self, name: &str) -> Result<u64> {
        let usage = match self.client.df().await {
            Ok(usage) => usage,
            Err(e) => {
                debug!(volume = %name, "Disk usage unavailable: {}", e);
                return Ok(0);
            }
        };

        Ok(usage
            .volumes
            .unwrap_or_default()
            .into_iter()
            .find(|v| v.name == name)
            .and_then(|v| v.usage_data)
            .map(|u| u.size.max(0) as u64)
            .unwrap_or(0))
    }

    async fn is_volume_in_use(&self, name: &str) -> Result<bool> {
        let filters = HashMap::from([("volume".to_string(), vec![name.to_string()])]);
        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let running = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| ProviderError::VolumeError(e.to_string()))?;
        Ok(!running.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatchery_core::ResourceLimits;

    fn provider() -> Option<DockerProvider> {
        DockerProvider::new().ok()
    }

    #[test]
    fn test_status_vocabulary() {
        assert_eq!(DockerProvider::convert_status("created"), ContainerStatus::Created);
        assert_eq!(DockerProvider::convert_status("running"), ContainerStatus::Running);
        assert_eq!(DockerProvider::convert_status("paused"), ContainerStatus::Running);
        assert_eq!(DockerProvider::convert_status("restarting"), ContainerStatus::Running);
        assert_eq!(DockerProvider::convert_status("exited"), ContainerStatus::Stopped);
        assert_eq!(DockerProvider::convert_status("dead"), ContainerStatus::Stopped);
        assert_eq!(DockerProvider::convert_status("removing"), ContainerStatus::Stopped);
    }

    #[test]
    fn test_container_config_conversion() {
        let Some(provider) = provider() else {
            println!("Skipping test: Docker client could not be constructed");
            return;
        };

        let spec = ContainerSpec {
            image: "alpine:latest".to_string(),
            env: HashMap::from([("FOO".to_string(), "bar".to_string())]),
            limits: ResourceLimits {
                memory_bytes: 512 * 1024 * 1024,
                cpu_count: 1.5,
            },
            ..Default::default()
        };

        let config = provider.to_bollard_config(&spec, "abc", "hatchery-vol-abc");

        assert_eq!(config.image, Some("alpine:latest".to_string()));
        assert_eq!(config.env, Some(vec!["FOO=bar".to_string()]));
        assert_eq!(
            config.cmd,
            Some(vec!["sleep".to_string(), "infinity".to_string()])
        );

        let labels = config.labels.unwrap();
        assert_eq!(labels.get(LABEL_SANDBOX_ID), Some(&"abc".to_string()));
        assert_eq!(labels.get(LABEL_VOLUME), Some(&"hatchery-vol-abc".to_string()));

        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(1_500_000_000));
        assert_eq!(
            host.binds,
            Some(vec!["hatchery-vol-abc:/workspace:rw".to_string()])
        );
    }

    #[tokio::test]
    async fn test_health_check_is_time_boxed() {
        // Nothing listens on port 9, so the check must report unhealthy rather than hang
        let provider = DockerProvider::forwarded(9)
            .unwrap()
            .with_health_timeout(Duration::from_millis(500));

        let report = provider.health_check().await;
        assert!(!report.healthy);
        assert!(report.message.is_some());
    }

    #[tokio::test]
    async fn test_inspect_missing_container_reports_not_found() {
        let Some(provider) = provider() else {
            println!("Skipping test: Docker not available");
            return;
        };
        if !provider.health_check().await.healthy {
            println!("Skipping test: Docker not available");
            return;
        }

        let inspection = provider
            .inspect_container("hatchery-does-not-exist")
            .await
            .unwrap();
        assert_eq!(inspection.status, ContainerStatus::NotFound);
    }

    #[tokio::test]
    async fn test_exec_against_missing_container_is_synthetic_failure() {
        let Some(provider) = provider() else {
            println!("Skipping test: Docker not available");
            return;
        };
        if !provider.health_check().await.healthy {
            println!("Skipping test: Docker not available");
            return;
        }

        let out = provider
            .execute_command(
                "hatchery-does-not-exist",
                &["true".to_string()],
                &HashMap::new(),
            )
            .await;
        assert_eq!(out.exit_code, crate::providers::TRANSPORT_FAILURE_EXIT_CODE);
    }
}
