// ABOUTME: Compute target routes and the registered-agent protocol endpoints
// ABOUTME: Registration, health checks, heartbeat, task poll and patch, inspect-request discovery

use crate::auth::{authorize_agent, CurrentUser};
use crate::error::{ApiError, Result};
use crate::response::ApiResponse;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use hatchery_core::utils::{generate_agent_token, hash_token};
use hatchery_core::{
    ComputeTarget, HealthStatus, InspectOutcome, TargetConnection, TargetKind, TaskStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTargetRequest {
    pub name: String,
    pub connection: TargetConnection,
    /// Replace an existing target with the same name
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTargetResponse {
    pub target: ComputeTarget,
    /// Bearer secret for registered targets; only ever returned here
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_token: Option<String>,
}

/// Register a compute target
pub async fn register_target(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<RegisterTargetRequest>,
) -> Result<Response> {
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::Validation("name must not be empty".to_string()));
    }

    let existing = state.store.find_target_by_name(&name).await?;
    if existing.is_some() && !request.force {
        return Err(ApiError::DuplicateTarget(name));
    }

    let mut target = ComputeTarget::new(&name, request.connection);
    let agent_token = (target.kind() == TargetKind::Registered).then(generate_agent_token);
    target.agent_token_hash = agent_token.as_deref().map(hash_token);

    let target = match existing {
        Some(previous) => {
            warn!(target_id = %previous.id, name = %name, user = %user.id, "Replacing compute target");
            target.id = previous.id;
            target.created_at = previous.created_at;
            state.store.update_target(target).await?
        }
        None => state.store.create_target(target).await?,
    };
    info!(target_id = %target.id, kind = %target.kind(), user = %user.id, "Compute target registered");

    Ok(ApiResponse::created(RegisterTargetResponse {
        target,
        agent_token,
    }))
}

pub async fn list_targets(State(state): State<AppState>, _user: CurrentUser) -> Result<Response> {
    let now = Utc::now();
    let interval = state.config.heartbeat_interval_secs;
    let targets: Vec<ComputeTarget> = state
        .store
        .list_targets()
        .await?
        .into_iter()
        .map(|mut target| {
            target.health = target.effective_health(now, interval);
            target
        })
        .collect();
    Ok(ApiResponse::ok(targets))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub target_id: String,
    pub health: HealthStatus,
    pub message: Option<String>,
    pub version: Option<String>,
}

/// Check a target and record the result
pub async fn check_health(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Response> {
    let target = state.store.get_target(&id).await?;

    let mut version = None;
    let (health, message) = if target.kind() == TargetKind::Registered {
        let health = target.effective_health(Utc::now(), state.config.heartbeat_interval_secs);
        let message = match health {
            HealthStatus::Connected => None,
            HealthStatus::Unknown => Some("No heartbeat received yet".to_string()),
            _ => Some("Heartbeats have stopped".to_string()),
        };
        (health, message)
    } else {
        let report = match state.providers.resolve(&target).await {
            Ok(provider) => provider.health_check().await,
            Err(e) => hatchery_sandbox::HealthReport::unhealthy(e.to_string()),
        };
        version = report.version;
        let health = if report.healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        (health, report.message)
    };

    let target = state.store.record_health(&id, health, message).await?;
    info!(target_id = %target.id, health = ?target.health, "Health checked");
    Ok(ApiResponse::ok(HealthResponse {
        target_id: target.id,
        health: target.health,
        message: target.health_message,
        version,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub target_id: String,
    pub health: HealthStatus,
    pub heartbeat_interval_secs: i64,
}

/// Liveness and host stats from a registered target
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(stats): Json<Value>,
) -> Result<Response> {
    authorize_agent(&state, &headers, &id).await?;
    let target = state.store.record_heartbeat(&id, stats, Utc::now()).await?;

    Ok(ApiResponse::ok(HeartbeatResponse {
        target_id: target.id,
        health: target.health,
        heartbeat_interval_secs: state.config.heartbeat_interval_secs,
    }))
}

/// Pending tasks queued for a registered target; polling does not claim them
pub async fn list_target_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    authorize_agent(&state, &headers, &id).await?;
    let tasks = state.store.list_tasks(&id, Some(TaskStatus::Pending)).await?;
    Ok(ApiResponse::ok(tasks))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub container_id: Option<String>,
    pub sandbox_id: Option<String>,
    pub error_message: Option<String>,
    pub output: Option<String>,
    pub raw_output: Option<String>,
    pub exit_code: Option<i64>,
    /// Shallow-merged into the stored config
    pub config: Option<Value>,
    /// Reject the patch unless the stored version still matches
    pub expected_version: Option<u64>,
}

/// Partial task update from the target running it
pub async fn patch_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(patch): Json<TaskPatch>,
) -> Result<Response> {
    authorize_agent(&state, &headers, &id).await?;
    let mut task = state.store.get_task(&task_id).await?;
    if task.target_id != id {
        return Err(ApiError::Forbidden(format!(
            "Task {} does not belong to target {}",
            task_id, id
        )));
    }
    if let Some(config) = &patch.config {
        if !config.is_object() {
            return Err(ApiError::Validation("config must be a JSON object".to_string()));
        }
    }

    if let Some(status) = patch.status {
        task.status = status;
    }
    if patch.container_id.is_some() {
        task.container_id = patch.container_id;
    }
    if patch.sandbox_id.is_some() {
        task.sandbox_id = patch.sandbox_id;
    }
    if patch.error_message.is_some() {
        task.error_message = patch.error_message;
    }
    if patch.output.is_some() {
        task.output = patch.output;
    }
    if patch.raw_output.is_some() {
        task.raw_output = patch.raw_output;
    }
    if patch.exit_code.is_some() {
        task.exit_code = patch.exit_code;
    }
    if let Some(config) = &patch.config {
        task.merge_config(config);
    }

    let task = state.store.update_task(task, patch.expected_version).await?;
    info!(task_id = %task.id, status = task.status.as_str(), version = task.version, "Task patched");
    Ok(ApiResponse::ok(task))
}

/// Pending inspect requests for a registered target
pub async fn list_inspect_requests(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    authorize_agent(&state, &headers, &id).await?;
    let requests = state.store.list_pending_inspect_requests(&id).await?;
    Ok(ApiResponse::ok(requests))
}

/// Resolve an inspect request; only the first resolution is accepted
pub async fn resolve_inspect_request(
    State(state): State<AppState>,
    Path((id, request_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(outcome): Json<InspectOutcome>,
) -> Result<Response> {
    authorize_agent(&state, &headers, &id).await?;
    let request = state.store.get_inspect_request(&request_id).await?;
    if request.target_id != id {
        return Err(ApiError::Forbidden(format!(
            "Inspect request {} does not belong to target {}",
            request_id, id
        )));
    }
    let request = state
        .store
        .resolve_inspect_request(&request_id, outcome)
        .await?;
    info!(request_id = %request.id, status = ?request.status, "Inspect request resolved");
    Ok(ApiResponse::ok(request))
}
