// ABOUTME: Worker loop for a registered target: heartbeat, claim and run tasks, answer inspections
// ABOUTME: Sandboxes are tracked in a local store; the server only sees task patches

use crate::client::{AgentClient, HeartbeatAck, TaskPatch};
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::stats::{self, HostStats};
use chrono::Utc;
use hatchery_core::{InspectOutcome, MemoryStore, Store, Task, TaskStatus};
use hatchery_provisioner::{ProvisionerConfig, TaskExecutor};
use hatchery_sandbox::{ContainerProvider, SandboxManager};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How often a running task is checked for a container id to report
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

pub struct Worker {
    client: AgentClient,
    provider: Arc<dyn ContainerProvider>,
    store: Arc<MemoryStore>,
    executor: TaskExecutor,
    config: WorkerConfig,
    started_at: Instant,
    runs: tokio::sync::Mutex<JoinSet<()>>,
    /// Server-side version of each claimed task that has not reported a result
    in_flight: Mutex<HashMap<String, u64>>,
    /// Reported tasks in completion order
    finished: Mutex<VecDeque<(Instant, String)>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn drain(runs: &mut JoinSet<()>) {
    while let Some(joined) = runs.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("Task run panicked: {}", e);
            }
        }
    }
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        provider: Arc<dyn ContainerProvider>,
        provisioner: ProvisionerConfig,
    ) -> Result<Self> {
        let client = AgentClient::new(&config)?;
        let store = Arc::new(MemoryStore::new());
        let executor = TaskExecutor::new(store.clone(), provisioner);
        Ok(Self {
            client,
            provider,
            store,
            executor,
            config,
            started_at: Instant::now(),
            runs: tokio::sync::Mutex::new(JoinSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
        })
    }

    /// Sandboxes and task mirrors created by this worker
    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    /// Heartbeat and poll on their intervals until `shutdown` resolves, then
    /// wind down in-flight task runs.
    ///
    /// Errors from one cycle are logged and the next cycle runs as usual.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            target_id = %self.config.target_id,
            server = %self.config.server_url,
            "Remote worker started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Remote worker stopping");
                    self.shutdown().await;
                    break;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!("Heartbeat failed: {}", e);
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("Poll failed: {}", e);
                    }
                    self.prune_finished().await;
                }
            }
        }
    }

    pub async fn host_stats(&self) -> HostStats {
        stats::collect(self.provider.as_ref(), self.started_at).await
    }

    pub async fn heartbeat(&self) -> Result<HeartbeatAck> {
        let stats = self.host_stats().await;
        let ack = self.client.heartbeat(&stats).await?;
        debug!(
            containers = stats.managed_containers,
            server_interval = ack.heartbeat_interval_secs,
            "Heartbeat sent"
        );
        Ok(ack)
    }

    /// Answer pending inspections, then claim and start every queued task.
    ///
    /// Returns how many task runs this cycle started.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize> {
        if let Err(e) = self.resolve_inspections().await {
            warn!("Failed to answer inspect requests: {}", e);
        }

        let mut runs = self.runs.lock().await;
        while runs.try_join_next().is_some() {}

        let mut started = 0;
        for task in self.client.pending_tasks().await? {
            let Some(claimed) = self.claim(&task).await? else {
                continue;
            };
            locked(&self.in_flight).insert(claimed.id.clone(), claimed.version);
            let worker = Arc::clone(self);
            runs.spawn(async move { worker.run_task(claimed).await });
            started += 1;
        }
        Ok(started)
    }

    /// Wait for every started task run to report
    pub async fn wait_for_runs(&self) {
        drain(&mut *self.runs.lock().await).await;
    }

    /// Give in-flight runs `shutdown_grace` to finish, then abort the rest,
    /// stop their sandboxes and report them stopped.
    pub async fn shutdown(&self) {
        let mut runs = self.runs.lock().await;
        if runs.is_empty() {
            return;
        }
        info!(
            runs = runs.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Waiting for task runs to finish"
        );
        if tokio::time::timeout(self.config.shutdown_grace, drain(&mut runs))
            .await
            .is_ok()
        {
            return;
        }
        runs.shutdown().await;
        drop(runs);

        let abandoned: Vec<(String, u64)> = locked(&self.in_flight).drain().collect();
        for (task_id, version) in abandoned {
            warn!(task_id = %task_id, "Task run cut short by shutdown");
            self.stop_local_sandbox(&task_id).await;
            self.report(&task_id, version, TaskPatch {
                status: Some(TaskStatus::Stopped),
                error_message: Some("Worker shut down before the task finished".to_string()),
                ..Default::default()
            })
            .await;
        }
    }

    async fn stop_local_sandbox(&self, task_id: &str) {
        let Some(sandbox_id) = self.store.get_task(task_id).await.ok().and_then(|t| t.sandbox_id) else {
            return;
        };
        let manager = SandboxManager::new(self.store.clone(), self.provider.clone());
        if let Err(e) = manager.stop_sandbox(&sandbox_id).await {
            warn!(task_id = %task_id, sandbox_id = %sandbox_id, "Failed to stop sandbox: {}", e);
        }
    }

    /// Drop finished tasks older than `task_retention` from the local mirror,
    /// along with their sandbox records. Returns how many were dropped.
    pub async fn prune_finished(&self) -> usize {
        let expired: Vec<String> = {
            let mut finished = locked(&self.finished);
            let mut expired = Vec::new();
            while let Some((at, _)) = finished.front() {
                if at.elapsed() < self.config.task_retention {
                    break;
                }
                if let Some((_, task_id)) = finished.pop_front() {
                    expired.push(task_id);
                }
            }
            expired
        };

        for task_id in &expired {
            if let Some(sandbox_id) = self.store.get_task(task_id).await.ok().and_then(|t| t.sandbox_id) {
                if let Err(e) = self.store.delete_sandbox(&sandbox_id).await {
                    debug!(sandbox_id = %sandbox_id, "Sandbox record already gone: {}", e);
                }
            }
            if let Err(e) = self.store.delete_task(task_id).await {
                debug!(task_id = %task_id, "Task mirror already gone: {}", e);
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Pruned finished tasks from the local mirror");
        }
        expired.len()
    }

    /// Move a task to running, guarded by the version we saw
    async fn claim(&self, task: &Task) -> Result<Option<Task>> {
        let patch = TaskPatch {
            status: Some(TaskStatus::Running),
            expected_version: Some(task.version),
            ..Default::default()
        };
        match self.client.patch_task(&task.id, &patch).await {
            Ok(claimed) => {
                info!(task_id = %claimed.id, "Task claimed");
                Ok(Some(claimed))
            }
            Err(e) if e.is_conflict() => {
                debug!(task_id = %task.id, "Task claimed elsewhere, skipping");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_task(&self, claimed: Task) {
        let task_id = claimed.id.clone();
        let mut version = claimed.version;

        let mut mirror = claimed;
        mirror.status = TaskStatus::Pending;
        if let Err(e) = self.store.create_task(mirror).await {
            error!(task_id = %task_id, "Failed to track task locally: {}", e);
            self.report(&task_id, version, TaskPatch {
                status: Some(TaskStatus::Error),
                error_message: Some(format!("Worker could not track task: {}", e)),
                ..Default::default()
            })
            .await;
            locked(&self.in_flight).remove(&task_id);
            return;
        }

        let run = self
            .executor
            .run(&task_id, self.provider.clone(), self.config.secrets.clone());
        tokio::pin!(run);
        let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
        let mut container_reported = false;

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = progress.tick(), if !container_reported => {
                    let Ok(local) = self.store.get_task(&task_id).await else {
                        continue;
                    };
                    if local.container_id.is_none() {
                        continue;
                    }
                    let patch = TaskPatch {
                        container_id: local.container_id,
                        sandbox_id: local.sandbox_id,
                        expected_version: Some(version),
                        ..Default::default()
                    };
                    match self.client.patch_task(&task_id, &patch).await {
                        Ok(task) => {
                            version = task.version;
                            locked(&self.in_flight).insert(task_id.clone(), version);
                            container_reported = true;
                        }
                        Err(e) if e.is_conflict() => {
                            warn!(task_id = %task_id, "Task changed on the server: {}", e);
                            container_reported = true;
                        }
                        Err(e) => warn!(task_id = %task_id, "Failed to report container: {}", e),
                    }
                }
            }
        };

        let patch = match outcome {
            Ok(task) => TaskPatch {
                status: Some(task.status),
                container_id: task.container_id,
                sandbox_id: task.sandbox_id,
                error_message: task.error_message,
                output: task.output,
                raw_output: task.raw_output,
                exit_code: task.exit_code,
                config: Some(task.config),
                ..Default::default()
            },
            Err(e) => TaskPatch {
                status: Some(TaskStatus::Error),
                error_message: Some(e.to_string()),
                ..Default::default()
            },
        };
        self.report(&task_id, version, patch).await;
        locked(&self.in_flight).remove(&task_id);
        locked(&self.finished).push_back((Instant::now(), task_id.clone()));
    }

    async fn report(&self, task_id: &str, version: u64, mut patch: TaskPatch) {
        patch.expected_version = Some(version);
        match self.client.patch_task(task_id, &patch).await {
            Ok(task) => info!(task_id = %task_id, status = task.status.as_str(), "Task result reported"),
            Err(e) if e.is_conflict() => {
                warn!(task_id = %task_id, "Task changed on the server while running; result dropped")
            }
            Err(e) => error!(task_id = %task_id, "Failed to report task result: {}", e),
        }
    }

    /// Resolve every pending inspect request; returns how many were answered
    pub async fn resolve_inspections(&self) -> Result<usize> {
        let mut answered = 0;
        for request in self.client.pending_inspect_requests().await? {
            let outcome = self.inspect(&request.task_id).await;
            match self.client.resolve_inspect_request(&request.id, &outcome).await {
                Ok(_) => answered += 1,
                Err(e) if e.is_conflict() => {
                    debug!(request_id = %request.id, "Inspect request already resolved")
                }
                Err(e) => warn!(request_id = %request.id, "Failed to resolve inspect request: {}", e),
            }
        }
        Ok(answered)
    }

    /// Live state of a task's sandbox on this host
    pub async fn inspect(&self, task_id: &str) -> InspectOutcome {
        let sandbox_id = match self.store.get_task(task_id).await {
            Ok(task) => task.sandbox_id,
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                return InspectOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        let Some(sandbox_id) = sandbox_id else {
            return InspectOutcome::Completed {
                result: json!({"status": "not_found"}),
            };
        };

        let manager = SandboxManager::new(self.store.clone(), self.provider.clone());
        match manager.inspect_sandbox(&sandbox_id).await {
            Ok(inspection) => {
                match serde_json::to_value(inspection.container.with_uptime(Utc::now())) {
                    Ok(result) => InspectOutcome::Completed { result },
                    Err(e) => InspectOutcome::Failed {
                        error: e.to_string(),
                    },
                }
            }
            Err(e) => InspectOutcome::Failed {
                error: e.to_string(),
            },
        }
    }
}
