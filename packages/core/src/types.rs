// ABOUTME: Core domain types shared by every Hatchery package
// ABOUTME: Compute targets, sandboxes, tasks and inspect requests with their status vocabularies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CoreError;

/// Kind of a compute target, derived from its connection parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Direct,
    Tunneled,
    Cluster,
    Registered,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Tunneled => "tunneled",
            Self::Cluster => "cluster",
            Self::Registered => "registered",
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "tunneled" => Ok(Self::Tunneled),
            "cluster" => Ok(Self::Cluster),
            "registered" => Ok(Self::Registered),
            _ => Err(CoreError::InvalidValue {
                field: "kind",
                value: s.to_string(),
            }),
        }
    }
}

/// SSH authentication material for tunneled targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SshAuth {
    Password {
        password: String,
    },
    PrivateKey {
        private_key_pem: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

/// Connection parameters of a compute target.
///
/// The variant determines the target kind, so a target can never declare one
/// kind while carrying another kind's parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TargetConnection {
    /// Container daemon on this host
    Direct {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        socket_path: Option<String>,
    },
    /// Container daemon on a remote host, reached through an SSH tunnel
    Tunneled {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        username: String,
        auth: SshAuth,
        #[serde(default = "default_remote_socket")]
        remote_socket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_key_fingerprint: Option<String>,
    },
    /// Cluster orchestrator API
    Cluster {
        api_server: String,
        token: String,
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ca_cert_pem: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        storage_class: Option<String>,
        #[serde(default = "default_volume_size")]
        volume_size: String,
    },
    /// Remote process that polls the server for work
    Registered,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_socket() -> String {
    crate::constants::DEFAULT_DOCKER_SOCKET.to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_volume_size() -> String {
    "10Gi".to_string()
}

impl TargetConnection {
    pub fn kind(&self) -> TargetKind {
        match self {
            Self::Direct { .. } => TargetKind::Direct,
            Self::Tunneled { .. } => TargetKind::Tunneled,
            Self::Cluster { .. } => TargetKind::Cluster,
            Self::Registered => TargetKind::Registered,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Connected,
}

/// A registered place where sandboxes can run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeTarget {
    pub id: String,
    pub name: String,
    pub connection: TargetConnection,
    pub health: HealthStatus,
    pub health_message: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Last stats blob reported by a heartbeat
    pub stats: Option<JsonValue>,
    /// SHA-256 hex digest of the per-target bearer secret (registered targets)
    #[serde(skip_serializing)]
    pub agent_token_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ComputeTarget {
    pub fn new(name: impl Into<String>, connection: TargetConnection) -> Self {
        Self {
            id: crate::utils::generate_id(),
            name: name.into(),
            connection,
            health: HealthStatus::Unknown,
            health_message: None,
            last_seen_at: None,
            stats: None,
            agent_token_hash: None,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.connection.kind()
    }

    /// Health as it should be reported at `now`.
    ///
    /// Registered targets are only `connected` while heartbeats are fresh.
    pub fn effective_health(&self, now: DateTime<Utc>, heartbeat_interval_secs: i64) -> HealthStatus {
        if self.kind() != TargetKind::Registered {
            return self.health;
        }
        match self.last_seen_at {
            Some(seen) if (now - seen).num_seconds() <= heartbeat_interval_secs * 3 => {
                HealthStatus::Connected
            }
            Some(_) => HealthStatus::Unhealthy,
            None => HealthStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_count: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 4 * 1024 * 1024 * 1024,
            cpu_count: 2.0,
        }
    }
}

/// One isolated execution environment: one compute unit plus one volume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    pub id: String,
    pub target_id: String,
    pub container_id: Option<String>,
    pub volume_id: Option<String>,
    pub limits: ResourceLimits,
    pub status: SandboxStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Sandbox {
    pub fn new(target_id: impl Into<String>, limits: ResourceLimits) -> Self {
        Self {
            id: crate::utils::generate_id(),
            target_id: target_id.into(),
            container_id: None,
            volume_id: None,
            limits,
            status: SandboxStatus::Creating,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }
}

/// An agent run queued against a compute target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub target_id: String,
    pub user_id: String,
    pub status: TaskStatus,
    pub container_id: Option<String>,
    pub sandbox_id: Option<String>,
    pub error_message: Option<String>,
    /// Run parameters; always a JSON object
    pub config: JsonValue,
    pub output: Option<String>,
    /// Unparsed command output kept for diagnosis when `output` is a digest of it
    #[serde(default)]
    pub raw_output: Option<String>,
    pub exit_code: Option<i64>,
    /// Bumped on every write; used for optimistic concurrency
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(target_id: impl Into<String>, user_id: impl Into<String>, config: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id: crate::utils::generate_id(),
            target_id: target_id.into(),
            user_id: user_id.into(),
            status: TaskStatus::Pending,
            container_id: None,
            sandbox_id: None,
            error_message: None,
            config: if config.is_object() {
                config
            } else {
                JsonValue::Object(Default::default())
            },
            output: None,
            raw_output: None,
            exit_code: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shallow-merge `patch` into the task config.
    ///
    /// Top-level keys in `patch` replace the stored value; other keys are kept.
    pub fn merge_config(&mut self, patch: &JsonValue) {
        let Some(incoming) = patch.as_object() else {
            return;
        };
        if !self.config.is_object() {
            self.config = JsonValue::Object(Default::default());
        }
        if let Some(existing) = self.config.as_object_mut() {
            for (key, value) in incoming {
                existing.insert(key.clone(), value.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectStatus {
    Pending,
    Completed,
    Failed,
}

/// Async handshake record for fetching live stats from an unreachable sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectRequest {
    pub id: String,
    pub task_id: String,
    pub target_id: String,
    pub status: InspectStatus,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

impl InspectRequest {
    pub fn pending(task_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            id: crate::utils::generate_id(),
            task_id: task_id.into(),
            target_id: target_id.into(),
            status: InspectStatus::Pending,
            requested_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == InspectStatus::Pending
    }
}

/// Terminal outcome reported by the remote process for an inspect request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InspectOutcome {
    Completed { result: JsonValue },
    Failed { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_connection_kind_is_derived() {
        let registered = TargetConnection::Registered;
        assert_eq!(registered.kind(), TargetKind::Registered);

        let json = json!({"kind": "cluster", "apiServer": "https://k8s:6443", "token": "t"});
        let cluster: TargetConnection = serde_json::from_value(json).unwrap();
        assert_eq!(cluster.kind(), TargetKind::Cluster);
        match cluster {
            TargetConnection::Cluster {
                namespace,
                volume_size,
                ..
            } => {
                assert_eq!(namespace, "default");
                assert_eq!(volume_size, "10Gi");
            }
            other => panic!("unexpected connection: {:?}", other),
        }
    }

    #[test]
    fn test_tunneled_defaults() {
        let json = json!({
            "kind": "tunneled",
            "host": "build-01",
            "username": "ops",
            "auth": {"method": "password", "password": "pw"}
        });
        let conn: TargetConnection = serde_json::from_value(json).unwrap();
        match conn {
            TargetConnection::Tunneled {
                port,
                remote_socket,
                ..
            } => {
                assert_eq!(port, 22);
                assert_eq!(remote_socket, "/var/run/docker.sock");
            }
            other => panic!("unexpected connection: {:?}", other),
        }
    }

    #[test]
    fn test_target_kind_from_str() {
        assert_eq!("Cluster".parse::<TargetKind>().unwrap(), TargetKind::Cluster);
        assert!("mainframe".parse::<TargetKind>().is_err());
    }

    #[test]
    fn test_merge_config_is_shallow() {
        let mut task = Task::new(
            "target",
            "user",
            json!({"repoUrl": "https://example.com/r.git", "agent": {"name": "claude-code"}}),
        );
        task.merge_config(&json!({"branch": "dev", "agent": {"backend": "acp"}}));

        assert_eq!(task.config["repoUrl"], "https://example.com/r.git");
        assert_eq!(task.config["branch"], "dev");
        // nested objects are replaced, not merged
        assert_eq!(task.config["agent"], json!({"backend": "acp"}));
    }

    #[test]
    fn test_non_object_config_is_normalized() {
        let task = Task::new("target", "user", json!("not an object"));
        assert!(task.config.is_object());
    }

    #[test]
    fn test_registered_health_tracks_heartbeat_age() {
        let mut target = ComputeTarget::new("edge", TargetConnection::Registered);
        let now = Utc::now();
        assert_eq!(target.effective_health(now, 15), HealthStatus::Unknown);

        target.last_seen_at = Some(now - Duration::seconds(20));
        assert_eq!(target.effective_health(now, 15), HealthStatus::Connected);

        target.last_seen_at = Some(now - Duration::seconds(60));
        assert_eq!(target.effective_health(now, 15), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_agent_token_hash_is_not_serialized() {
        let mut target = ComputeTarget::new("edge", TargetConnection::Registered);
        target.agent_token_hash = Some("abc".to_string());
        let json = serde_json::to_value(&target).unwrap();
        assert!(json.get("agentTokenHash").is_none());
    }
}
