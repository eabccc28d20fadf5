// ABOUTME: HTTP API layer for Hatchery providing the REST endpoints and routing
// ABOUTME: Users manage targets and tasks; registered targets heartbeat, poll and patch

use axum::{
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::future::Future;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod auth;
pub mod config;
pub mod error;
pub mod response;
pub mod servers;
pub mod state;
pub mod tasks;

pub use auth::{CurrentUser, StaticUserTokens, UserAuthenticator};
pub use config::{ApiConfig, ConfigError};
pub use error::ApiError;
pub use state::{AppState, FactoryResolver, ProviderResolver};

/// Routes used by registered targets, authenticated by the target's bearer secret
fn create_servers_router() -> Router<AppState> {
    Router::new()
        .route("/", get(servers::list_targets).post(servers::register_target))
        .route("/{id}/health", post(servers::check_health))
        .route("/{id}/heartbeat", post(servers::heartbeat))
        .route("/{id}/tasks", get(servers::list_target_tasks))
        .route("/{id}/tasks/{task_id}", patch(servers::patch_task))
        .route("/{id}/inspect-requests", get(servers::list_inspect_requests))
        .route(
            "/{id}/inspect-requests/{request_id}",
            patch(servers::resolve_inspect_request),
        )
}

fn create_tasks_router() -> Router<AppState> {
    Router::new()
        .route("/", post(tasks::create_task))
        .route("/{id}", get(tasks::get_task))
        .route("/{id}/inspect", get(tasks::inspect_task))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/servers", create_servers_router())
        .nest("/tasks", create_tasks_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on the configured address until `shutdown` resolves
pub async fn serve<F>(state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind = state.config.bind;
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Hatchery API listening on {}", listener.local_addr()?);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
