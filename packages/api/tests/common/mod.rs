// ABOUTME: Shared fixtures for API tests: an in-memory app and a one-shot request helper
// ABOUTME: Providers resolve to a single scripted in-memory provider

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use hatchery_api::{create_router, ApiConfig, AppState, ProviderResolver};
use hatchery_core::{ComputeTarget, MemoryStore};
use hatchery_sandbox::testing::InMemoryProvider;
use hatchery_sandbox::{ContainerProvider, FactoryError};
use http_body_util::BodyExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

pub const ALICE: &str = "tok-alice";
pub const BOB: &str = "tok-bob";

pub struct ScriptedResolver(pub Arc<InMemoryProvider>);

#[async_trait]
impl ProviderResolver for ScriptedResolver {
    async fn resolve(&self, _target: &ComputeTarget) -> Result<Arc<dyn ContainerProvider>, FactoryError> {
        Ok(self.0.clone())
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<InMemoryProvider>,
}

pub fn app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(InMemoryProvider::new());
    let config = ApiConfig {
        user_tokens: HashMap::from([
            (ALICE.to_string(), "alice".to_string()),
            (BOB.to_string(), "bob".to_string()),
        ]),
        ..Default::default()
    };
    let state = AppState::new(store.clone(), config)
        .with_providers(Arc::new(ScriptedResolver(provider.clone())));
    TestApp {
        router: create_router(state),
        store,
        provider,
    }
}

pub fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn read(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

pub async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request(method, uri, token, body))
        .await
        .unwrap();
    read(response).await
}

/// Register a target as alice; returns its id and agent token, if any
pub async fn register(router: &Router, name: &str, connection: Value) -> (String, Option<String>) {
    let (status, body) = send(
        router,
        Method::POST,
        "/servers",
        Some(ALICE),
        Some(serde_json::json!({"name": name, "connection": connection})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    (
        body["data"]["target"]["id"].as_str().unwrap().to_string(),
        body["data"]["agentToken"].as_str().map(str::to_string),
    )
}

pub fn task_config() -> Value {
    serde_json::json!({
        "repoUrl": "https://github.com/acme/widgets.git",
        "branch": "main",
        "agent": "claude",
        "prompt": "fix the flaky test"
    })
}
