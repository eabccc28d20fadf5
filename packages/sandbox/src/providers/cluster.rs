// ABOUTME: Cluster provider backing sandboxes with pods and persistent volume claims
// ABOUTME: Talks to the orchestrator REST API with reqwest and runs exec over a channel-multiplexed websocket

use super::{
    sandbox_labels, volume_labels, ContainerInspection, ContainerProvider, ContainerSpec,
    ContainerStatus, ContainerSummary, CreatedContainer, ExecOutput, HealthReport, ProviderError,
    ResourceUsage, Result, VolumeFilter, VolumeInfo, TRANSPORT_FAILURE_EXIT_CODE,
};
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use futures::StreamExt;
use hatchery_core::constants::{
    container_name, sandbox_id_from_container, volume_name, ANNOTATION_POD_TEMPLATE,
    LABEL_MANAGED, LABEL_SANDBOX_ID, LABEL_VOLUME, WORKSPACE_DIR,
};
use hatchery_core::TargetKind;
use rand::RngCore;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{protocol::Role, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Name of the single container inside every sandbox pod
const SANDBOX_CONTAINER: &str = "sandbox";

/// Exec subprotocol multiplexing stdin/stdout/stderr/status over one socket
const EXEC_SUBPROTOCOL: &str = "v4.channel.k8s.io";

const CHANNEL_STDOUT: u8 = 1;
const CHANNEL_STDERR: u8 = 2;
const CHANNEL_STATUS: u8 = 3;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub api_server: String,
    pub token: String,
    pub namespace: String,
    pub ca_cert_pem: Option<String>,
    pub storage_class: Option<String>,
    /// Requested size of each sandbox claim, e.g. `10Gi`
    pub volume_size: String,
    pub request_timeout: Duration,
    pub health_timeout: Duration,
    /// Attempts to recreate a pod while its predecessor is still terminating
    pub recreate_attempts: u32,
}

impl ClusterConfig {
    pub fn new(api_server: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_server: api_server.into(),
            token: token.into(),
            namespace: "default".to_string(),
            ca_cert_pem: None,
            storage_class: None,
            volume_size: "10Gi".to_string(),
            request_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            recreate_attempts: 10,
        }
    }
}

pub struct ClusterProvider {
    config: ClusterConfig,
    client: reqwest::Client,
    /// HTTP/1.1-only client; exec needs a connection upgrade and no overall timeout
    exec_client: reqwest::Client,
}

impl ClusterProvider {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.request_timeout);
        let mut exec_builder = reqwest::Client::builder()
            .http1_only()
            .connect_timeout(config.request_timeout);

        if let Some(pem) = &config.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| ProviderError::ConfigError(format!("Invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert.clone());
            exec_builder = exec_builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| ProviderError::ConfigError(e.to_string()))?;
        let exec_client = exec_builder
            .build()
            .map_err(|e| ProviderError::ConfigError(e.to_string()))?;

        Ok(Self {
            config,
            client,
            exec_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_server.trim_end_matches('/'), path)
    }

    fn namespaced(&self, resource: &str) -> String {
        self.url(&format!(
            "/api/v1/namespaces/{}/{}",
            self.config.namespace, resource
        ))
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.client.request(method, url).bearer_auth(&self.config.token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))
    }

    /// Turn a non-success response into a typed error carrying the API message
    async fn api_error(response: Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        ProviderError::ClusterApi { status, message }
    }

    async fn json(response: Response) -> Result<Value> {
        response
            .json()
            .await
            .map_err(|e| ProviderError::InternalError(format!("Malformed API response: {}", e)))
    }

    /// GET a namespaced object, returning None on 404
    async fn get_object(&self, resource: &str) -> Result<Option<Value>> {
        let response = self.send(self.request(Method::GET, self.namespaced(resource))).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(Self::json(response).await?)),
            _ => Err(Self::api_error(response).await),
        }
    }

    /// POST a namespaced object; an existing object counts as success
    async fn create_object(&self, collection: &str, body: &Value) -> Result<bool> {
        let response = self
            .send(self.request(Method::POST, self.namespaced(collection)).json(body))
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(Self::api_error(response).await),
        }
    }

    /// DELETE a namespaced object; a missing object counts as success
    async fn delete_object(&self, resource: &str, grace_period_secs: Option<u64>) -> Result<()> {
        let mut request = self.request(Method::DELETE, self.namespaced(resource));
        if let Some(grace) = grace_period_secs {
            request = request.query(&[("gracePeriodSeconds", grace.to_string())]);
        }
        let response = self.send(request).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => Ok(()),
            _ => Err(Self::api_error(response).await),
        }
    }

    fn claim_manifest(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
        annotations: Option<HashMap<String, String>>,
    ) -> Value {
        let mut spec = json!({
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": self.config.volume_size } },
        });
        if let Some(class) = &self.config.storage_class {
            spec["storageClassName"] = json!(class);
        }

        let mut metadata = json!({ "name": name, "labels": labels });
        if let Some(annotations) = annotations {
            metadata["annotations"] = json!(annotations);
        }

        json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": metadata,
            "spec": spec,
        })
    }

    fn pod_manifest(&self, sandbox_id: &str, volume: &str, spec: &ContainerSpec) -> Value {
        let mut labels = spec.labels.clone();
        labels.extend(sandbox_labels(sandbox_id, volume));

        let env: Vec<Value> = spec
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let cpu = format!("{}m", (spec.limits.cpu_count * 1000.0).round() as u64);
        let memory = spec.limits.memory_bytes.to_string();

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": container_name(sandbox_id),
                "labels": labels,
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": SANDBOX_CONTAINER,
                    "image": spec.image,
                    "command": spec.idle_command(),
                    "workingDir": spec.working_dir,
                    "env": env,
                    "resources": {
                        "limits": { "cpu": cpu, "memory": memory },
                        "requests": { "cpu": cpu, "memory": memory },
                    },
                    "volumeMounts": [{ "name": "workspace", "mountPath": WORKSPACE_DIR }],
                }],
                "volumes": [{
                    "name": "workspace",
                    "persistentVolumeClaim": { "claimName": volume },
                }],
            },
        })
    }

    /// Store the pod template on an existing claim
    async fn annotate_claim(&self, claim: &str, template: &str) -> Result<()> {
        let patch = json!({
            "metadata": { "annotations": { ANNOTATION_POD_TEMPLATE: template } }
        });
        let response = self
            .send(
                self.request(
                    Method::PATCH,
                    self.namespaced(&format!("persistentvolumeclaims/{}", claim)),
                )
                .header("Content-Type", "application/merge-patch+json")
                .body(patch.to_string()),
            )
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    /// Recreate a pod from the template stored on its claim
    async fn recreate_pod(&self, pod_name: &str) -> Result<()> {
        let sandbox_id = sandbox_id_from_container(pod_name)
            .ok_or_else(|| ProviderError::NotFound(pod_name.to_string()))?;
        let claim_name = volume_name(sandbox_id);

        let claim = self
            .get_object(&format!("persistentvolumeclaims/{}", claim_name))
            .await?
            .ok_or_else(|| ProviderError::NotFound(pod_name.to_string()))?;

        let template = claim
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(ANNOTATION_POD_TEMPLATE))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProviderError::ContainerError(format!(
                    "Claim {} carries no pod template",
                    claim_name
                ))
            })?;
        let manifest: Value = serde_json::from_str(template)
            .map_err(|e| ProviderError::InternalError(format!("Corrupt pod template: {}", e)))?;

        // The previous pod may still be terminating under the same name
        for attempt in 0..self.config.recreate_attempts.max(1) {
            if self.create_object("pods", &manifest).await? {
                info!(pod = %pod_name, "Recreated pod from claim template");
                return Ok(());
            }
            debug!(pod = %pod_name, attempt, "Previous pod still terminating");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Err(ProviderError::ContainerError(format!(
            "Pod {} is still terminating",
            pod_name
        )))
    }

    async fn pod_usage(&self, pod_name: &str, pod: &Value) -> Option<ResourceUsage> {
        let url = self.url(&format!(
            "/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods/{}",
            self.config.namespace, pod_name
        ));
        let response = self.send(self.request(Method::GET, url)).await.ok()?;
        if !response.status().is_success() {
            debug!(pod = %pod_name, status = %response.status(), "Pod metrics unavailable");
            return None;
        }
        let metrics: Value = response.json().await.ok()?;

        let (cores, memory) = metrics
            .get("containers")
            .and_then(Value::as_array)
            .map(|containers| {
                containers.iter().fold((0.0, 0u64), |(cpu, mem), c| {
                    let usage = c.get("usage");
                    let c_cpu = usage
                        .and_then(|u| u.get("cpu"))
                        .and_then(Value::as_str)
                        .and_then(parse_cpu_cores)
                        .unwrap_or(0.0);
                    let c_mem = usage
                        .and_then(|u| u.get("memory"))
                        .and_then(Value::as_str)
                        .and_then(parse_memory_bytes)
                        .unwrap_or(0);
                    (cpu + c_cpu, mem + c_mem)
                })
            })?;

        let memory_limit = pod
            .pointer("/spec/containers/0/resources/limits/memory")
            .and_then(Value::as_str)
            .and_then(parse_memory_bytes)
            .unwrap_or(0);

        Some(ResourceUsage {
            cpu_percent: cores * 100.0,
            memory_bytes: memory,
            memory_limit_bytes: memory_limit,
        })
    }

    /// Map pod phases onto the shared status vocabulary
    pub(crate) fn convert_phase(phase: &str) -> ContainerStatus {
        match phase {
            "Pending" => ContainerStatus::Created,
            "Running" => ContainerStatus::Running,
            _ => ContainerStatus::Stopped,
        }
    }

    async fn run_exec(
        &self,
        pod_name: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ExecOutput> {
        let mut command: Vec<String> = Vec::new();
        if !env.is_empty() {
            command.push("env".to_string());
            command.extend(env.iter().map(|(k, v)| format!("{}={}", k, v)));
        }
        command.extend(argv.iter().cloned());

        let mut url = url::Url::parse(&self.namespaced(&format!("pods/{}/exec", pod_name)))
            .map_err(|e| ProviderError::ConfigError(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("container", SANDBOX_CONTAINER);
            query.append_pair("stdout", "true");
            query.append_pair("stderr", "true");
            for part in &command {
                query.append_pair("command", part);
            }
        }

        let mut key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        let key = base64::engine::general_purpose::STANDARD.encode(key);

        let response = self
            .exec_client
            .get(url.as_str())
            .bearer_auth(&self.config.token)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", key)
            .header("Sec-WebSocket-Protocol", EXEC_SUBPROTOCOL)
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(Self::api_error(response).await);
        }

        let upgraded = response
            .upgrade()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        let mut socket = WebSocketStream::from_raw_socket(upgraded, Role::Client, None).await;

        let mut output = Vec::new();
        let mut status: Option<(i64, Option<String>)> = None;
        while let Some(message) = socket.next().await {
            let message = message.map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
            match message {
                Message::Binary(frame) => match frame.split_first() {
                    Some((&CHANNEL_STDOUT, data)) | Some((&CHANNEL_STDERR, data)) => {
                        output.extend_from_slice(data)
                    }
                    Some((&CHANNEL_STATUS, data)) => status = Some(parse_exec_status(data)),
                    _ => {}
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        let mut text = String::from_utf8_lossy(&output).into_owned();
        let exit_code = match status {
            Some((code, message)) => {
                if let Some(message) = message.filter(|_| code == TRANSPORT_FAILURE_EXIT_CODE) {
                    text.push_str(&message);
                }
                code
            }
            None => TRANSPORT_FAILURE_EXIT_CODE,
        };
        Ok(ExecOutput::new(exit_code, text))
    }
}

/// Decode the status frame sent on channel 3 when the remote process exits
pub(crate) fn parse_exec_status(data: &[u8]) -> (i64, Option<String>) {
    let Ok(status) = serde_json::from_slice::<Value>(data) else {
        return (TRANSPORT_FAILURE_EXIT_CODE, Some("unreadable exec status".to_string()));
    };

    if status.get("status").and_then(Value::as_str) == Some("Success") {
        return (0, None);
    }

    let exit_code = status
        .pointer("/details/causes")
        .and_then(Value::as_array)
        .and_then(|causes| {
            causes.iter().find_map(|cause| {
                (cause.get("reason").and_then(Value::as_str) == Some("ExitCode"))
                    .then(|| cause.get("message").and_then(Value::as_str))
                    .flatten()
                    .and_then(|m| m.parse::<i64>().ok())
            })
        });

    match exit_code {
        Some(code) => (code, None),
        None => (
            TRANSPORT_FAILURE_EXIT_CODE,
            status
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        ),
    }
}

/// Parse a CPU quantity (`2`, `250m`, `1500u`, `123456n`) into cores
pub(crate) fn parse_cpu_cores(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let (number, scale) = match quantity.chars().last()? {
        'n' => (&quantity[..quantity.len() - 1], 1e-9),
        'u' => (&quantity[..quantity.len() - 1], 1e-6),
        'm' => (&quantity[..quantity.len() - 1], 1e-3),
        _ => (quantity, 1.0),
    };
    number.parse::<f64>().ok().map(|n| n * scale)
}

/// Parse a memory quantity (`512Mi`, `1G`, `1048576`) into bytes
pub(crate) fn parse_memory_bytes(quantity: &str) -> Option<u64> {
    const SUFFIXES: [(&str, f64); 10] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
    ];

    let quantity = quantity.trim();
    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| (n * multiplier) as u64);
        }
    }
    quantity.parse::<f64>().ok().map(|n| n as u64)
}

fn label_selector(labels: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    pairs.sort();
    pairs.join(",")
}

/// A pod counts as active while it runs or is scheduled and has not been marked for deletion
fn pod_is_active(pod: &Value) -> bool {
    let terminating = pod
        .pointer("/metadata/deletionTimestamp")
        .is_some_and(|ts| !ts.is_null());
    !terminating
        && matches!(
            pod.pointer("/status/phase").and_then(Value::as_str),
            Some("Pending") | Some("Running")
        )
}

#[async_trait]
impl ContainerProvider for ClusterProvider {
    fn kind(&self) -> TargetKind {
        TargetKind::Cluster
    }

    async fn health_check(&self) -> HealthReport {
        let check = async {
            let response = self.send(self.request(Method::GET, self.url("/version"))).await?;
            if !response.status().is_success() {
                return Err(Self::api_error(response).await);
            }
            let version = Self::json(response).await?;
            Ok::<_, ProviderError>(
                version
                    .get("gitVersion")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            )
        };

        match tokio::time::timeout(self.config.health_timeout, check).await {
            Ok(Ok(version)) => HealthReport::healthy(version),
            Ok(Err(e)) => {
                warn!("Cluster API not available: {}", e);
                HealthReport::unhealthy(e.to_string())
            }
            Err(_) => HealthReport::unhealthy(format!(
                "Cluster API did not respond within {:?}",
                self.config.health_timeout
            )),
        }
    }

    async fn create_container(
        &self,
        sandbox_id: &str,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer> {
        let claim = volume_name(sandbox_id);
        let pod_name = container_name(sandbox_id);
        info!(sandbox_id = %sandbox_id, pod = %pod_name, claim = %claim, "Creating pod");

        let pod = self.pod_manifest(sandbox_id, &claim, spec);
        let template = pod.to_string();

        let claim_body = self.claim_manifest(
            &claim,
            &volume_labels(sandbox_id),
            Some(HashMap::from([(
                ANNOTATION_POD_TEMPLATE.to_string(),
                template.clone(),
            )])),
        );
        if !self
            .create_object("persistentvolumeclaims", &claim_body)
            .await?
        {
            debug!(claim = %claim, "Claim already exists, refreshing pod template");
            self.annotate_claim(&claim, &template).await?;
        }

        if !self.create_object("pods", &pod).await? {
            debug!(pod = %pod_name, "Pod already exists, reusing");
        }

        Ok(CreatedContainer {
            container_id: pod_name,
            volume_id: claim,
        })
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!(pod = %container_id, "Starting pod");

        match self.get_object(&format!("pods/{}", container_id)).await? {
            Some(pod) if pod_is_active(&pod) => {
                debug!(pod = %container_id, "Pod already running");
                Ok(())
            }
            Some(_) => {
                // Finished or terminating pods cannot be restarted in place
                self.delete_object(&format!("pods/{}", container_id), Some(0))
                    .await?;
                self.recreate_pod(container_id).await
            }
            None => self.recreate_pod(container_id).await,
        }
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        info!(pod = %container_id, "Stopping pod");
        self.delete_object(&format!("pods/{}", container_id), Some(10))
            .await
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspection> {
        let Some(pod) = self.get_object(&format!("pods/{}", container_id)).await? else {
            // Stopped sandboxes keep their claim but lose the pod
            let claim = sandbox_id_from_container(container_id).map(volume_name);
            let status = match claim {
                Some(claim) => {
                    match self
                        .get_object(&format!("persistentvolumeclaims/{}", claim))
                        .await?
                    {
                        Some(_) => ContainerStatus::Stopped,
                        None => ContainerStatus::NotFound,
                    }
                }
                None => ContainerStatus::NotFound,
            };
            return Ok(ContainerInspection {
                status,
                ..ContainerInspection::not_found()
            });
        };

        let phase = pod
            .pointer("/status/phase")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let status = Self::convert_phase(phase);

        let started_at = pod
            .pointer("/status/startTime")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let terminated = pod.pointer("/status/containerStatuses/0/state/terminated");
        let exit_code = terminated
            .and_then(|t| t.get("exitCode"))
            .and_then(Value::as_i64);

        let message = pod
            .pointer("/status/message")
            .or_else(|| pod.pointer("/status/containerStatuses/0/state/waiting/reason"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let usage = if status == ContainerStatus::Running {
            self.pod_usage(container_id, &pod).await
        } else {
            None
        };

        Ok(ContainerInspection {
            status,
            started_at,
            uptime_secs: None,
            usage,
            exit_code,
            message,
        }
        .with_uptime(Utc::now()))
    }

    async fn get_logs(&self, container_id: &str, tail: Option<usize>) -> Result<String> {
        let mut request = self
            .request(
                Method::GET,
                self.namespaced(&format!("pods/{}/log", container_id)),
            )
            .query(&[("container", SANDBOX_CONTAINER)]);
        if let Some(lines) = tail {
            request = request.query(&[("tailLines", lines.to_string())]);
        }

        let response = self.send(request).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound(container_id.to_string())),
            s if s.is_success() => response
                .text()
                .await
                .map_err(|e| ProviderError::ConnectionError(e.to_string())),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn remove_container(
        &self,
        container_id: &str,
        volume_id: Option<&str>,
        preserve_volume: bool,
    ) -> Result<()> {
        info!(pod = %container_id, preserve_volume, "Removing pod");

        self.delete_object(&format!("pods/{}", container_id), Some(10))
            .await?;

        if let (Some(volume), false) = (volume_id, preserve_volume) {
            if let Err(e) = self.delete_volume(volume).await {
                warn!(claim = %volume, "Failed to remove claim after pod removal: {}", e);
            }
        }
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let response = self
            .send(
                self.request(Method::GET, self.namespaced("pods"))
                    .query(&[("labelSelector", format!("{}=true", LABEL_MANAGED))]),
            )
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let list = Self::json(response).await?;

        Ok(list
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|pod| {
                        let name = pod.pointer("/metadata/name")?.as_str()?.to_string();
                        let labels = pod.pointer("/metadata/labels");
                        let label = |key: &str| {
                            labels
                                .and_then(|l| l.get(key))
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        };
                        Some(ContainerSummary {
                            id: name.clone(),
                            status: Self::convert_phase(
                                pod.pointer("/status/phase")
                                    .and_then(Value::as_str)
                                    .unwrap_or("Unknown"),
                            ),
                            sandbox_id: label(LABEL_SANDBOX_ID),
                            volume: label(LABEL_VOLUME),
                            name,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn execute_command(
        &self,
        container_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> ExecOutput {
        debug!(pod = %container_id, command = ?argv.first(), "Executing command");

        match self.run_exec(container_id, argv, env).await {
            Ok(output) => output,
            Err(e) => {
                warn!(pod = %container_id, "Exec transport failure: {}", e);
                ExecOutput::transport_failure(e)
            }
        }
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<String> {
        self.create_object(
            "persistentvolumeclaims",
            &self.claim_manifest(name, labels, None),
        )
        .await?;
        Ok(name.to_string())
    }

    async fn list_volumes(&self, filter: &VolumeFilter) -> Result<Vec<VolumeInfo>> {
        let mut request = self.request(Method::GET, self.namespaced("persistentvolumeclaims"));
        if !filter.labels.is_empty() {
            request = request.query(&[("labelSelector", label_selector(&filter.labels))]);
        }

        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let list = Self::json(response).await?;

        Ok(list
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|claim| {
                        let metadata = claim.get("metadata")?;
                        Some(VolumeInfo {
                            name: metadata.get("name")?.as_str()?.to_string(),
                            labels: metadata
                                .get("labels")
                                .and_then(|l| serde_json::from_value(l.clone()).ok())
                                .unwrap_or_default(),
                            created_at: metadata
                                .get("creationTimestamp")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        })
                    })
                    .filter(|v| filter.matches(v))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        if self.is_volume_in_use(name).await? {
            return Err(ProviderError::VolumeInUse(name.to_string()));
        }
        self.delete_object(&format!("persistentvolumeclaims/{}", name), None)
            .await
    }

    async fn get_volume_size(&self, name: &str) -> Result<u64> {
        // Claims expose requested capacity only, not bytes used
        debug!(claim = %name, "Volume usage not exposed by cluster API");
        Ok(0)
    }

    async fn is_volume_in_use(&self, name: &str) -> Result<bool> {
        let response = self.send(self.request(Method::GET, self.namespaced("pods"))).await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let list = Self::json(response).await?;

        let in_use = list
            .get("items")
            .and_then(Value::as_array)
            .map(|pods| {
                pods.iter().filter(|pod| pod_is_active(pod)).any(|pod| {
                    pod.pointer("/spec/volumes")
                        .and_then(Value::as_array)
                        .map(|volumes| {
                            volumes.iter().any(|v| {
                                v.pointer("/persistentVolumeClaim/claimName")
                                    .and_then(Value::as_str)
                                    == Some(name)
                            })
                        })
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        Ok(in_use)
    }
}
