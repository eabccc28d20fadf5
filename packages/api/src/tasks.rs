// ABOUTME: Task routes for users: create and dispatch, read, and the inspect handshake
// ABOUTME: Registered targets are inspected through pending requests resolved by their remote worker

use crate::auth::CurrentUser;
use crate::error::{ApiError, Result};
use crate::response::ApiResponse;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hatchery_core::{ComputeTarget, InspectRequest, InspectStatus, TargetKind, Task, TaskStatus};
use hatchery_provisioner::TaskRunConfig;
use hatchery_sandbox::SandboxManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

/// Longest a caller may wait for an inspect request to resolve
pub const MAX_INSPECT_WAIT_SECS: u64 = 30;
/// How long a resolved inspect result is served before a new request is opened
pub const INSPECT_FRESH_SECS: i64 = 10;
const INSPECT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub target_id: String,
    pub config: Value,
    /// Handed to the agent process for this run only; never stored
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Queue a task; tasks for reachable targets are dispatched immediately
pub async fn create_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Response> {
    if !request.config.is_object() {
        return Err(ApiError::Validation("config must be a JSON object".to_string()));
    }
    let target = state.store.get_target(&request.target_id).await?;

    let mut config = request.config;
    if let Some(object) = config.as_object_mut() {
        object.remove("secrets");
    }
    let task = Task::new(&target.id, &user.id, config);
    TaskRunConfig::from_task(&task)?;

    let task = state.store.create_task(task).await?;
    info!(task_id = %task.id, target_id = %target.id, user = %user.id, "Task queued");

    if target.kind() != TargetKind::Registered {
        dispatch(state.clone(), target, task.id.clone(), request.secrets);
    }
    Ok(ApiResponse::created(task))
}

fn dispatch(state: AppState, target: ComputeTarget, task_id: String, secrets: HashMap<String, String>) {
    tokio::spawn(async move {
        let provider = match state.providers.resolve(&target).await {
            Ok(provider) => provider,
            Err(e) => {
                error!(task_id = %task_id, target_id = %target.id, "No provider for target: {}", e);
                if let Ok(mut task) = state.store.get_task(&task_id).await {
                    let expected = task.version;
                    task.status = TaskStatus::Error;
                    task.error_message = Some(format!("Compute target unavailable: {}", e));
                    if let Err(e) = state.store.update_task(task, Some(expected)).await {
                        error!(task_id = %task_id, "Failed to record dispatch failure: {}", e);
                    }
                }
                return;
            }
        };
        if let Err(e) = state.executor.run(&task_id, provider, secrets).await {
            error!(task_id = %task_id, "Task execution failed: {}", e);
        }
    });
}

async fn owned_task(state: &AppState, user: &CurrentUser, id: &str) -> Result<Task> {
    let task = state.store.get_task(id).await?;
    if task.user_id != user.id {
        // Other users' tasks are indistinguishable from missing ones
        return Err(ApiError::NotFound(format!("task not found: {}", id)));
    }
    Ok(task)
}

pub async fn get_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Response> {
    Ok(ApiResponse::ok(owned_task(&state, &user, &id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectQuery {
    pub request_id: Option<String>,
    #[serde(default)]
    pub wait_secs: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectResponse {
    pub status: InspectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Live state of a task's sandbox.
///
/// Reachable targets are inspected in place. Registered targets answer 202
/// with a pending request id until their worker resolves it; `waitSecs`
/// holds the request open for up to thirty seconds.
pub async fn inspect_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Query(query): Query<InspectQuery>,
) -> Result<Response> {
    let task = owned_task(&state, &user, &id).await?;
    let target = state.store.get_target(&task.target_id).await?;

    if target.kind() != TargetKind::Registered {
        return inspect_directly(&state, &target, &task).await;
    }

    let request = match &query.request_id {
        Some(request_id) => {
            let request = state.store.get_inspect_request(request_id).await?;
            if request.task_id != task.id {
                return Err(ApiError::NotFound(format!(
                    "inspect request not found: {}",
                    request_id
                )));
            }
            request
        }
        None => match state.store.latest_inspect_request(&task.id).await? {
            Some(latest) if is_fresh(&latest, Utc::now()) => {
                return respond(latest, false);
            }
            _ => {
                let (request, created) = state
                    .store
                    .open_inspect_request(&task.id, &target.id)
                    .await?;
                if created {
                    info!(task_id = %task.id, request_id = %request.id, "Inspect request opened");
                }
                request
            }
        },
    };

    let wait = Duration::from_secs(query.wait_secs.min(MAX_INSPECT_WAIT_SECS));
    let request = wait_for_resolution(&state, request, wait).await?;
    respond(request, true)
}

/// Resolved recently enough to serve without asking the worker again
fn is_fresh(request: &InspectRequest, now: DateTime<Utc>) -> bool {
    !request.is_pending()
        && request
            .completed_at
            .is_some_and(|done| now - done <= ChronoDuration::seconds(INSPECT_FRESH_SECS))
}

/// Poll the store until the request resolves or `wait` elapses.
///
/// Runs inside the request future, so a dropped connection ends the wait.
async fn wait_for_resolution(
    state: &AppState,
    mut request: InspectRequest,
    wait: Duration,
) -> Result<InspectRequest> {
    let deadline = Instant::now() + wait;
    while request.is_pending() && Instant::now() < deadline {
        tokio::time::sleep(INSPECT_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())))
            .await;
        request = state.store.get_inspect_request(&request.id).await?;
    }
    Ok(request)
}

fn respond(request: InspectRequest, include_id: bool) -> Result<Response> {
    match request.status {
        InspectStatus::Pending => Ok(ApiResponse::with_status(
            StatusCode::ACCEPTED,
            InspectResponse {
                status: InspectStatus::Pending,
                request_id: Some(request.id),
                result: None,
            },
        )),
        InspectStatus::Completed => Ok(ApiResponse::ok(InspectResponse {
            status: InspectStatus::Completed,
            request_id: include_id.then_some(request.id),
            result: request.result,
        })),
        InspectStatus::Failed => Err(ApiError::InspectFailed(
            request.error.unwrap_or_else(|| "inspection failed".to_string()),
        )),
    }
}

async fn inspect_directly(state: &AppState, target: &ComputeTarget, task: &Task) -> Result<Response> {
    let Some(sandbox_id) = &task.sandbox_id else {
        return Ok(ApiResponse::ok(InspectResponse {
            status: InspectStatus::Completed,
            request_id: None,
            result: Some(serde_json::json!({"status": "not_found"})),
        }));
    };
    let provider = state.providers.resolve(target).await?;
    let manager = SandboxManager::new(state.store.clone(), provider);
    let inspection = manager.inspect_sandbox(sandbox_id).await?;
    let result = serde_json::to_value(inspection.container.with_uptime(Utc::now()))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(ApiResponse::ok(InspectResponse {
        status: InspectStatus::Completed,
        request_id: None,
        result: Some(result),
    }))
}
