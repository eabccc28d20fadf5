// ABOUTME: In-process container provider with scripted exec results for tests
// ABOUTME: Tracks units, volumes and every executed command so callers can assert on them

use crate::providers::{
    sandbox_labels, volume_labels, ContainerInspection, ContainerProvider, ContainerSpec,
    ContainerStatus, ContainerSummary, CreatedContainer, ExecOutput, HealthReport, ProviderError,
    Result, VolumeFilter, VolumeInfo,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hatchery_core::constants::{container_name, volume_name};
use hatchery_core::TargetKind;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// One command seen by `execute_command`
#[derive(Debug, Clone)]
pub struct ExecRecord {
    pub container_id: String,
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
}

impl ExecRecord {
    /// argv joined with spaces, handy for substring assertions
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

type ExecHandler = Box<dyn Fn(&ExecRecord) -> Option<ExecOutput> + Send + Sync>;

struct Unit {
    sandbox_id: String,
    volume: String,
    status: ContainerStatus,
    started_at: Option<DateTime<Utc>>,
    spec: ContainerSpec,
    logs: Vec<String>,
}

struct State {
    units: HashMap<String, Unit>,
    volumes: HashMap<String, VolumeInfo>,
    volume_sizes: HashMap<String, u64>,
    pinned_volumes: HashSet<String>,
    executed: Vec<ExecRecord>,
    healthy: bool,
    fail_volume_deletes: bool,
}

pub struct InMemoryProvider {
    kind: TargetKind,
    state: Mutex<State>,
    /// Consulted in order; the first handler returning Some wins
    handlers: Mutex<Vec<ExecHandler>>,
    /// Commands containing any of these never complete
    stalled: Mutex<Vec<String>>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::with_kind(TargetKind::Direct)
    }

    pub fn with_kind(kind: TargetKind) -> Self {
        Self {
            kind,
            state: Mutex::new(State {
                units: HashMap::new(),
                volumes: HashMap::new(),
                volume_sizes: HashMap::new(),
                pinned_volumes: HashSet::new(),
                executed: Vec::new(),
                healthy: true,
                fail_volume_deletes: false,
            }),
            handlers: Mutex::new(Vec::new()),
            stalled: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer commands whose command line contains `needle` with `output`
    pub fn respond_to(&self, needle: impl Into<String>, output: ExecOutput) {
        let needle = needle.into();
        self.on_exec(move |record| {
            record
                .command_line()
                .contains(&needle)
                .then(|| output.clone())
        });
    }

    /// Register a handler; unmatched commands succeed with empty output
    pub fn on_exec<F>(&self, handler: F)
    where
        F: Fn(&ExecRecord) -> Option<ExecOutput> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(handler));
    }

    /// Leave commands whose command line contains `needle` running forever
    pub fn stall_on(&self, needle: impl Into<String>) {
        self.stalled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(needle.into());
    }

    pub fn executed(&self) -> Vec<ExecRecord> {
        self.state().executed.clone()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state().healthy = healthy;
    }

    pub fn set_volume_size(&self, name: &str, bytes: u64) {
        self.state().volume_sizes.insert(name.to_string(), bytes);
    }

    /// Report the volume as mounted regardless of unit state
    pub fn mark_volume_in_use(&self, name: &str) {
        self.state().pinned_volumes.insert(name.to_string());
    }

    pub fn fail_volume_deletes(&self, fail: bool) {
        self.state().fail_volume_deletes = fail;
    }

    pub fn push_log(&self, container_id: &str, line: impl Into<String>) {
        if let Some(unit) = self.state().units.get_mut(container_id) {
            unit.logs.push(line.into());
        }
    }

    pub fn status_of(&self, container_id: &str) -> ContainerStatus {
        self.state()
            .units
            .get(container_id)
            .map(|u| u.status)
            .unwrap_or(ContainerStatus::NotFound)
    }

    /// Spec the unit was created with
    pub fn spec_of(&self, container_id: &str) -> Option<ContainerSpec> {
        self.state().units.get(container_id).map(|u| u.spec.clone())
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state().volumes.contains_key(name)
    }

    fn volume_in_use(state: &State, name: &str) -> bool {
        state.pinned_volumes.contains(name)
            || state
                .units
                .values()
                .any(|u| u.volume == name && u.status == ContainerStatus::Running)
    }
}

#[async_trait]
impl ContainerProvider for InMemoryProvider {
    fn kind(&self) -> TargetKind {
        self.kind
    }

    async fn health_check(&self) -> HealthReport {
        if self.state().healthy {
            HealthReport::healthy("in-memory")
        } else {
            HealthReport::unhealthy("in-memory provider marked unhealthy")
        }
    }

    async fn create_container(
        &self,
        sandbox_id: &str,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer> {
        let container_id = container_name(sandbox_id);
        let volume = volume_name(sandbox_id);

        let mut state = self.state();
        state
            .volumes
            .entry(volume.clone())
            .or_insert_with(|| VolumeInfo {
                name: volume.clone(),
                labels: volume_labels(sandbox_id),
                created_at: Some(Utc::now().to_rfc3339()),
            });

        let mut spec = spec.clone();
        spec.labels.extend(sandbox_labels(sandbox_id, &volume));
        state.units.entry(container_id.clone()).or_insert(Unit {
            sandbox_id: sandbox_id.to_string(),
            volume: volume.clone(),
            status: ContainerStatus::Created,
            started_at: None,
            spec,
            logs: Vec::new(),
        });

        Ok(CreatedContainer {
            container_id,
            volume_id: volume,
        })
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state();
        let unit = state
            .units
            .get_mut(container_id)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        if unit.status != ContainerStatus::Running {
            unit.status = ContainerStatus::Running;
            unit.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state();
        let unit = state
            .units
            .get_mut(container_id)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        if unit.status == ContainerStatus::Running {
            unit.status = ContainerStatus::Stopped;
        }
        Ok(())
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspection> {
        let state = self.state();
        let Some(unit) = state.units.get(container_id) else {
            return Ok(ContainerInspection::not_found());
        };
        Ok(ContainerInspection {
            status: unit.status,
            started_at: unit.started_at,
            ..ContainerInspection::not_found()
        }
        .with_uptime(Utc::now()))
    }

    async fn get_logs(&self, container_id: &str, tail: Option<usize>) -> Result<String> {
        let state = self.state();
        let unit = state
            .units
            .get(container_id)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        let skip = tail.map_or(0, |n| unit.logs.len().saturating_sub(n));
        Ok(unit.logs[skip..].join("\n"))
    }

    async fn remove_container(
        &self,
        container_id: &str,
        volume_id: Option<&str>,
        preserve_volume: bool,
    ) -> Result<()> {
        self.state().units.remove(container_id);
        if let (Some(volume), false) = (volume_id, preserve_volume) {
            let _ = self.delete_volume(volume).await;
        }
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .state()
            .units
            .iter()
            .map(|(id, unit)| ContainerSummary {
                id: id.clone(),
                name: id.clone(),
                status: unit.status,
                sandbox_id: Some(unit.sandbox_id.clone()),
                volume: Some(unit.volume.clone()),
            })
            .collect())
    }

    async fn execute_command(
        &self,
        container_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> ExecOutput {
        let record = ExecRecord {
            container_id: container_id.to_string(),
            argv: argv.to_vec(),
            env: env.clone(),
        };

        {
            let mut state = self.state();
            state.executed.push(record.clone());
            match state.units.get(container_id).map(|u| u.status) {
                Some(ContainerStatus::Running) => {}
                Some(_) => return ExecOutput::transport_failure("container is not running"),
                None => return ExecOutput::transport_failure("no such container"),
            }
        }

        let stalls = {
            let line = record.command_line();
            let stalled = self.stalled.lock().unwrap_or_else(|e| e.into_inner());
            stalled.iter().any(|needle| line.contains(needle.as_str()))
        };
        if stalls {
            return std::future::pending().await;
        }

        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers
            .iter()
            .find_map(|handler| handler(&record))
            .unwrap_or_else(|| ExecOutput::new(0, ""))
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<String> {
        self.state()
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| VolumeInfo {
                name: name.to_string(),
                labels: labels.clone(),
                created_at: Some(Utc::now().to_rfc3339()),
            });
        Ok(name.to_string())
    }

    async fn list_volumes(&self, filter: &VolumeFilter) -> Result<Vec<VolumeInfo>> {
        Ok(self
            .state()
            .volumes
            .values()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect())
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_volume_deletes {
            return Err(ProviderError::VolumeError(format!(
                "refusing to delete {}",
                name
            )));
        }
        if Self::volume_in_use(&state, name) {
            return Err(ProviderError::VolumeInUse(name.to_string()));
        }
        state.volumes.remove(name);
        state.volume_sizes.remove(name);
        Ok(())
    }

    async fn get_volume_size(&self, name: &str) -> Result<u64> {
        Ok(self.state().volume_sizes.get(name).copied().unwrap_or(0))
    }

    async fn is_volume_in_use(&self, name: &str) -> Result<bool> {
        Ok(Self::volume_in_use(&self.state(), name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let provider = InMemoryProvider::new();
        let created = provider
            .create_container("abc", &ContainerSpec::default())
            .await
            .unwrap();

        provider.start_container(&created.container_id).await.unwrap();
        let first = provider
            .inspect_container(&created.container_id)
            .await
            .unwrap()
            .started_at;
        provider.start_container(&created.container_id).await.unwrap();
        let second = provider
            .inspect_container(&created.container_id)
            .await
            .unwrap()
            .started_at;
        assert_eq!(first, second);

        provider.stop_container(&created.container_id).await.unwrap();
        provider.stop_container(&created.container_id).await.unwrap();
        assert_eq!(
            provider.status_of(&created.container_id),
            ContainerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_scripted_exec_and_records() {
        let provider = InMemoryProvider::new();
        let created = provider
            .create_container("abc", &ContainerSpec::default())
            .await
            .unwrap();
        provider.start_container(&created.container_id).await.unwrap();
        provider.respond_to("git --version", ExecOutput::new(0, "git version 2.43.0"));

        let out = provider
            .execute_command(&created.container_id, &argv(&["git", "--version"]), &HashMap::new())
            .await;
        assert_eq!(out.output, "git version 2.43.0");

        let other = provider
            .execute_command(&created.container_id, &argv(&["true"]), &HashMap::new())
            .await;
        assert!(other.success());
        assert_eq!(provider.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_exec_in_stopped_unit_is_transport_failure() {
        let provider = InMemoryProvider::new();
        let created = provider
            .create_container("abc", &ContainerSpec::default())
            .await
            .unwrap();
        let out = provider
            .execute_command(&created.container_id, &argv(&["true"]), &HashMap::new())
            .await;
        assert_eq!(out.exit_code, crate::providers::TRANSPORT_FAILURE_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_remove_then_inspect_reports_not_found() {
        let provider = InMemoryProvider::new();
        let created = provider
            .create_container("abc", &ContainerSpec::default())
            .await
            .unwrap();
        provider.start_container(&created.container_id).await.unwrap();

        provider
            .remove_container(&created.container_id, Some(&created.volume_id), false)
            .await
            .unwrap();

        let inspection = provider
            .inspect_container(&created.container_id)
            .await
            .unwrap();
        assert_eq!(inspection.status, ContainerStatus::NotFound);
        assert!(!provider.has_volume(&created.volume_id));
    }

    #[tokio::test]
    async fn test_logs_tail() {
        let provider = InMemoryProvider::new();
        let created = provider
            .create_container("abc", &ContainerSpec::default())
            .await
            .unwrap();
        for line in ["one", "two", "three"] {
            provider.push_log(&created.container_id, line);
        }
        let logs = provider
            .get_logs(&created.container_id, Some(2))
            .await
            .unwrap();
        assert_eq!(logs, "two\nthree");
    }
}
