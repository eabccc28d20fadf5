// ABOUTME: Store contract for targets, sandboxes, tasks and inspect requests
// ABOUTME: The persistent store is external; MemoryStore backs tests and single-process deployments

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::constants::INSPECT_RETENTION_SECS;
use crate::error::{StoreError, StoreResult};
use crate::types::{
    ComputeTarget, HealthStatus, InspectOutcome, InspectRequest, InspectStatus, Sandbox, SandboxStatus, Task,
    TaskStatus,
};

/// Create/find/update operations the core needs from the persistent store
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a target; names are unique
    async fn create_target(&self, target: ComputeTarget) -> StoreResult<ComputeTarget>;
    async fn get_target(&self, id: &str) -> StoreResult<ComputeTarget>;
    async fn find_target_by_name(&self, name: &str) -> StoreResult<Option<ComputeTarget>>;
    async fn update_target(&self, target: ComputeTarget) -> StoreResult<ComputeTarget>;
    async fn list_targets(&self) -> StoreResult<Vec<ComputeTarget>>;
    /// Mark a target connected and store its latest stats; other fields are untouched
    async fn record_heartbeat(
        &self,
        id: &str,
        stats: JsonValue,
        at: DateTime<Utc>,
    ) -> StoreResult<ComputeTarget>;
    /// Store a health check result; other fields are untouched
    async fn record_health(
        &self,
        id: &str,
        health: HealthStatus,
        message: Option<String>,
    ) -> StoreResult<ComputeTarget>;
    /// Delete a target unless a non-stopped sandbox still references it
    async fn delete_target(&self, id: &str) -> StoreResult<()>;

    async fn create_sandbox(&self, sandbox: Sandbox) -> StoreResult<Sandbox>;
    async fn get_sandbox(&self, id: &str) -> StoreResult<Sandbox>;
    async fn update_sandbox(&self, sandbox: Sandbox) -> StoreResult<Sandbox>;
    async fn list_sandboxes(&self, target_id: Option<&str>) -> StoreResult<Vec<Sandbox>>;
    async fn delete_sandbox(&self, id: &str) -> StoreResult<()>;

    async fn create_task(&self, task: Task) -> StoreResult<Task>;
    async fn get_task(&self, id: &str) -> StoreResult<Task>;
    async fn list_tasks(
        &self,
        target_id: &str,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<Task>>;
    /// Write a task, bumping its version.
    ///
    /// With `expected_version` the write only succeeds when the stored version
    /// still matches; without it the write is last-write-wins.
    async fn update_task(&self, task: Task, expected_version: Option<u64>) -> StoreResult<Task>;
    async fn delete_task(&self, id: &str) -> StoreResult<()>;

    /// Return the pending inspect request for a task, creating one if none is
    /// pending. The flag is true when a new request was created.
    async fn open_inspect_request(
        &self,
        task_id: &str,
        target_id: &str,
    ) -> StoreResult<(InspectRequest, bool)>;
    async fn get_inspect_request(&self, id: &str) -> StoreResult<InspectRequest>;
    async fn latest_inspect_request(&self, task_id: &str) -> StoreResult<Option<InspectRequest>>;
    async fn list_pending_inspect_requests(
        &self,
        target_id: &str,
    ) -> StoreResult<Vec<InspectRequest>>;
    /// Move a pending request to its terminal state; fails if already resolved
    async fn resolve_inspect_request(
        &self,
        id: &str,
        outcome: InspectOutcome,
    ) -> StoreResult<InspectRequest>;
}

#[derive(Default)]
struct MemoryState {
    targets: HashMap<String, ComputeTarget>,
    sandboxes: HashMap<String, Sandbox>,
    tasks: HashMap<String, Task>,
    inspect_requests: HashMap<String, InspectRequest>,
}

/// Store kept entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_target(&self, target: ComputeTarget) -> StoreResult<ComputeTarget> {
        let mut state = self.state.write().await;
        if state.targets.values().any(|t| t.name == target.name) {
            return Err(StoreError::Duplicate {
                entity: "compute target",
                key: target.name,
            });
        }
        state.targets.insert(target.id.clone(), target.clone());
        Ok(target)
    }

    async fn get_target(&self, id: &str) -> StoreResult<ComputeTarget> {
        let state = self.state.read().await;
        state
            .targets
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("compute target", id))
    }

    async fn find_target_by_name(&self, name: &str) -> StoreResult<Option<ComputeTarget>> {
        let state = self.state.read().await;
        Ok(state.targets.values().find(|t| t.name == name).cloned())
    }

    async fn update_target(&self, target: ComputeTarget) -> StoreResult<ComputeTarget> {
        let mut state = self.state.write().await;
        if !state.targets.contains_key(&target.id) {
            return Err(StoreError::not_found("compute target", target.id));
        }
        state.targets.insert(target.id.clone(), target.clone());
        Ok(target)
    }

    async fn list_targets(&self) -> StoreResult<Vec<ComputeTarget>> {
        let state = self.state.read().await;
        let mut targets: Vec<_> = state.targets.values().cloned().collect();
        targets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(targets)
    }

    async fn record_heartbeat(
        &self,
        id: &str,
        stats: JsonValue,
        at: DateTime<Utc>,
    ) -> StoreResult<ComputeTarget> {
        let mut state = self.state.write().await;
        let target = state
            .targets
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("compute target", id))?;
        target.last_seen_at = Some(at);
        target.health = HealthStatus::Connected;
        target.health_message = None;
        target.stats = Some(stats);
        Ok(target.clone())
    }

    async fn record_health(
        &self,
        id: &str,
        health: HealthStatus,
        message: Option<String>,
    ) -> StoreResult<ComputeTarget> {
        let mut state = self.state.write().await;
        let target = state
            .targets
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("compute target", id))?;
        target.health = health;
        target.health_message = message;
        Ok(target.clone())
    }

    async fn delete_target(&self, id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.targets.contains_key(id) {
            return Err(StoreError::not_found("compute target", id));
        }
        let referenced = state
            .sandboxes
            .values()
            .any(|s| s.target_id == id && s.status != SandboxStatus::Stopped);
        if referenced {
            return Err(StoreError::InUse {
                entity: "compute target",
                id: id.to_string(),
            });
        }
        state.targets.remove(id);
        Ok(())
    }

    async fn create_sandbox(&self, sandbox: Sandbox) -> StoreResult<Sandbox> {
        let mut state = self.state.write().await;
        if state.sandboxes.contains_key(&sandbox.id) {
            return Err(StoreError::Duplicate {
                entity: "sandbox",
                key: sandbox.id,
            });
        }
        state.sandboxes.insert(sandbox.id.clone(), sandbox.clone());
        Ok(sandbox)
    }

    async fn get_sandbox(&self, id: &str) -> StoreResult<Sandbox> {
        let state = self.state.read().await;
        state
            .sandboxes
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("sandbox", id))
    }

    async fn update_sandbox(&self, sandbox: Sandbox) -> StoreResult<Sandbox> {
        let mut state = self.state.write().await;
        if !state.sandboxes.contains_key(&sandbox.id) {
            return Err(StoreError::not_found("sandbox", sandbox.id));
        }
        state.sandboxes.insert(sandbox.id.clone(), sandbox.clone());
        Ok(sandbox)
    }

    async fn list_sandboxes(&self, target_id: Option<&str>) -> StoreResult<Vec<Sandbox>> {
        let state = self.state.read().await;
        Ok(state
            .sandboxes
            .values()
            .filter(|s| target_id.map_or(true, |t| s.target_id == t))
            .cloned()
            .collect())
    }

    async fn delete_sandbox(&self, id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .sandboxes
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("sandbox", id))
    }

    async fn create_task(&self, task: Task) -> StoreResult<Task> {
        let mut state = self.state.write().await;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate {
                entity: "task",
                key: task.id,
            });
        }
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &str) -> StoreResult<Task> {
        let state = self.state.read().await;
        state
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    async fn list_tasks(
        &self,
        target_id: &str,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.target_id == target_id)
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn update_task(&self, mut task: Task, expected_version: Option<u64>) -> StoreResult<Task> {
        let mut state = self.state.write().await;
        let stored = state
            .tasks
            .get(&task.id)
            .ok_or_else(|| StoreError::not_found("task", &task.id))?;

        if let Some(expected) = expected_version {
            if stored.version != expected {
                return Err(StoreError::VersionConflict {
                    expected,
                    actual: stored.version,
                });
            }
        }

        task.version = stored.version + 1;
        task.updated_at = Utc::now();
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn delete_task(&self, id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .tasks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    async fn open_inspect_request(
        &self,
        task_id: &str,
        target_id: &str,
    ) -> StoreResult<(InspectRequest, bool)> {
        // Check and insert under one write lock so two callers cannot both create
        let mut state = self.state.write().await;
        let cutoff = Utc::now() - Duration::seconds(INSPECT_RETENTION_SECS);
        state
            .inspect_requests
            .retain(|_, r| r.completed_at.unwrap_or(r.requested_at) > cutoff);

        if let Some(existing) = state
            .inspect_requests
            .values()
            .find(|r| r.task_id == task_id && r.is_pending())
        {
            return Ok((existing.clone(), false));
        }

        let request = InspectRequest::pending(task_id, target_id);
        state
            .inspect_requests
            .insert(request.id.clone(), request.clone());
        Ok((request, true))
    }

    async fn get_inspect_request(&self, id: &str) -> StoreResult<InspectRequest> {
        let state = self.state.read().await;
        state
            .inspect_requests
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("inspect request", id))
    }

    async fn latest_inspect_request(&self, task_id: &str) -> StoreResult<Option<InspectRequest>> {
        let state = self.state.read().await;
        Ok(state
            .inspect_requests
            .values()
            .filter(|r| r.task_id == task_id)
            .max_by_key(|r| r.requested_at)
            .cloned())
    }

    async fn list_pending_inspect_requests(
        &self,
        target_id: &str,
    ) -> StoreResult<Vec<InspectRequest>> {
        let state = self.state.read().await;
        let mut pending: Vec<_> = state
            .inspect_requests
            .values()
            .filter(|r| r.target_id == target_id && r.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(pending)
    }

    async fn resolve_inspect_request(
        &self,
        id: &str,
        outcome: InspectOutcome,
    ) -> StoreResult<InspectRequest> {
        let mut state = self.state.write().await;
        let request = state
            .inspect_requests
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("inspect request", id))?;

        if !request.is_pending() {
            return Err(StoreError::AlreadyResolved(id.to_string()));
        }

        match outcome {
            InspectOutcome::Completed { result } => {
                request.status = InspectStatus::Completed;
                request.result = Some(result);
            }
            InspectOutcome::Failed { error } => {
                request.status = InspectStatus::Failed;
                request.error = Some(error);
            }
        }
        request.completed_at = Some(Utc::now());
        Ok(request.clone())
    }
}
