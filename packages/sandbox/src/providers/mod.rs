// ABOUTME: Container provider contract shared by the local, tunneled and cluster backends
// ABOUTME: Defines container specs, inspection results, exec output and volume descriptors

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hatchery_core::constants::WORKSPACE_DIR;
use hatchery_core::{ResourceLimits, TargetKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub mod cluster;
pub mod docker;
pub mod tunneled;

pub use cluster::{ClusterConfig, ClusterProvider};
pub use docker::DockerProvider;
pub use tunneled::TunneledDockerProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Volume error: {0}")]
    VolumeError(String),

    #[error("Volume {0} is in use by a running container")]
    VolumeInUse(String),

    #[error("Cluster API returned {status}: {message}")]
    ClusterApi { status: u16, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Exit code reported when a command could not be run or its result was lost
pub const TRANSPORT_FAILURE_EXIT_CODE: i64 = -1;

/// Image used when a container spec does not name one
pub const DEFAULT_IMAGE: &str = "node:20-bookworm";

/// What to run inside a new sandbox compute unit
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub env: HashMap<String, String>,
    /// Entrypoint override; defaults to a long-lived idle process
    pub command: Option<Vec<String>>,
    pub working_dir: String,
    pub limits: ResourceLimits,
    pub labels: HashMap<String, String>,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            env: HashMap::new(),
            command: None,
            working_dir: WORKSPACE_DIR.to_string(),
            limits: ResourceLimits::default(),
            labels: HashMap::new(),
        }
    }
}

impl ContainerSpec {
    pub fn idle_command(&self) -> Vec<String> {
        self.command
            .clone()
            .unwrap_or_else(|| vec!["sleep".to_string(), "infinity".to_string()])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedContainer {
    pub container_id: String,
    pub volume_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub version: Option<String>,
    pub message: Option<String>,
}

impl HealthReport {
    pub fn healthy(version: impl Into<String>) -> Self {
        Self {
            healthy: true,
            version: Some(version.into()),
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            version: None,
            message: Some(message.into()),
        }
    }
}

/// Backend-independent status vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    NotFound,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInspection {
    pub status: ContainerStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<i64>,
    pub usage: Option<ResourceUsage>,
    pub exit_code: Option<i64>,
    pub message: Option<String>,
}

impl ContainerInspection {
    pub fn not_found() -> Self {
        Self {
            status: ContainerStatus::NotFound,
            started_at: None,
            uptime_secs: None,
            usage: None,
            exit_code: None,
            message: None,
        }
    }

    /// Fill in uptime from `started_at` when the unit is running
    pub fn with_uptime(mut self, now: DateTime<Utc>) -> Self {
        if self.status == ContainerStatus::Running {
            self.uptime_secs = self
                .started_at
                .map(|started| (now - started).num_seconds().max(0));
        }
        self
    }
}

/// Managed compute unit as reported by a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub sandbox_id: Option<String>,
    pub volume: Option<String>,
}

/// Combined output and real exit code of one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn new(exit_code: i64, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    /// Result for a command whose transport failed before an exit code was known
    pub fn transport_failure(message: impl std::fmt::Display) -> Self {
        Self {
            exit_code: TRANSPORT_FAILURE_EXIT_CODE,
            output: format!("transport error: {}", message),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub created_at: Option<String>,
}

/// Name prefix and label constraints for volume listings
#[derive(Debug, Clone, Default)]
pub struct VolumeFilter {
    pub name_prefix: Option<String>,
    pub labels: HashMap<String, String>,
}

impl VolumeFilter {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(prefix.into()),
            labels: HashMap::new(),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, volume: &VolumeInfo) -> bool {
        let prefix_ok = self
            .name_prefix
            .as_deref()
            .map_or(true, |prefix| volume.name.starts_with(prefix));
        let labels_ok = self
            .labels
            .iter()
            .all(|(k, v)| volume.labels.get(k) == Some(v));
        prefix_ok && labels_ok
    }
}

/// Uniform lifecycle, exec and volume operations over one backend
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    fn kind(&self) -> TargetKind;

    /// Time-boxed reachability check; never fails, reports unhealthy instead
    async fn health_check(&self) -> HealthReport;

    /// Provision the sandbox volume, then a compute unit labelled with the
    /// sandbox id and volume name. Re-creating an existing sandbox succeeds.
    async fn create_container(
        &self,
        sandbox_id: &str,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer>;

    /// No-op when already running
    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// No-op when already stopped
    async fn stop_container(&self, container_id: &str) -> Result<()>;

    /// Missing units report `ContainerStatus::NotFound` rather than an error
    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspection>;

    async fn get_logs(&self, container_id: &str, tail: Option<usize>) -> Result<String>;

    /// Stop if running, remove the unit, then remove the volume unless
    /// preserved. Volume removal failures are logged and swallowed.
    async fn remove_container(
        &self,
        container_id: &str,
        volume_id: Option<&str>,
        preserve_volume: bool,
    ) -> Result<()>;

    /// Units carrying the managed label
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Run `argv` to completion. Transport failures become a synthetic
    /// non-zero exit code with the error text as output.
    async fn execute_command(
        &self,
        container_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> ExecOutput;

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<String>;

    async fn list_volumes(&self, filter: &VolumeFilter) -> Result<Vec<VolumeInfo>>;

    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// Bytes used, or 0 when the backend cannot tell
    async fn get_volume_size(&self, name: &str) -> Result<u64>;

    /// True while a running unit still mounts the volume
    async fn is_volume_in_use(&self, name: &str) -> Result<bool>;
}

/// Standard labels placed on every sandbox compute unit
pub fn sandbox_labels(sandbox_id: &str, volume: &str) -> HashMap<String, String> {
    use hatchery_core::constants::{LABEL_MANAGED, LABEL_SANDBOX_ID, LABEL_VOLUME};

    HashMap::from([
        (LABEL_SANDBOX_ID.to_string(), sandbox_id.to_string()),
        (LABEL_VOLUME.to_string(), volume.to_string()),
        (LABEL_MANAGED.to_string(), "true".to_string()),
    ])
}

/// Standard labels placed on every sandbox volume
pub fn volume_labels(sandbox_id: &str) -> HashMap<String, String> {
    use hatchery_core::constants::{LABEL_MANAGED, LABEL_SANDBOX_ID};

    HashMap::from([
        (LABEL_SANDBOX_ID.to_string(), sandbox_id.to_string()),
        (LABEL_MANAGED.to_string(), "true".to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failure_is_nonzero() {
        let out = ExecOutput::transport_failure("broken pipe");
        assert_eq!(out.exit_code, TRANSPORT_FAILURE_EXIT_CODE);
        assert!(!out.success());
        assert!(out.output.contains("broken pipe"));
    }

    #[test]
    fn test_volume_filter_matches_prefix_and_labels() {
        let volume = VolumeInfo {
            name: "hatchery-vol-abc".to_string(),
            labels: HashMap::from([("hatchery.managed".to_string(), "true".to_string())]),
            created_at: None,
        };

        assert!(VolumeFilter::with_prefix("hatchery-vol-").matches(&volume));
        assert!(VolumeFilter::default()
            .label("hatchery.managed", "true")
            .matches(&volume));
        assert!(!VolumeFilter::with_prefix("other-").matches(&volume));
        assert!(!VolumeFilter::default()
            .label("hatchery.managed", "false")
            .matches(&volume));
    }

    #[test]
    fn test_uptime_only_for_running() {
        let started = Utc::now() - chrono::Duration::seconds(90);
        let running = ContainerInspection {
            status: ContainerStatus::Running,
            started_at: Some(started),
            ..ContainerInspection::not_found()
        }
        .with_uptime(Utc::now());
        assert!(running.uptime_secs.unwrap() >= 90);

        let stopped = ContainerInspection {
            status: ContainerStatus::Stopped,
            started_at: Some(started),
            ..ContainerInspection::not_found()
        }
        .with_uptime(Utc::now());
        assert_eq!(stopped.uptime_secs, None);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ContainerStatus::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
    }
}
