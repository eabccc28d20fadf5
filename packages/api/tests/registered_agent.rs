// ABOUTME: Registered-agent protocol over HTTP: registration, heartbeat, poll, patch
// ABOUTME: Also covers bearer authentication and optimistic concurrency on task patches

mod common;

use axum::http::{Method, StatusCode};
use common::{app, register, send, task_config, ALICE};
use hatchery_core::Store;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn test_duplicate_target_needs_force() {
    let app = app();
    let (first_id, first_token) = register(&app.router, "build-box", json!({"kind": "registered"})).await;

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/servers",
        Some(ALICE),
        Some(json!({"name": "build-box", "connection": {"kind": "registered"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "DUPLICATE_TARGET");

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/servers",
        Some(ALICE),
        Some(json!({"name": "build-box", "connection": {"kind": "registered"}, "force": true})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["target"]["id"], first_id);
    let new_token = body["data"]["agentToken"].as_str().unwrap();
    assert_ne!(Some(new_token.to_string()), first_token);

    // The replaced secret no longer authenticates
    let (status, _) = send(
        &app.router,
        Method::POST,
        &format!("/servers/{}/heartbeat", first_id),
        first_token.as_deref(),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_agent_token_is_not_exposed_again() {
    let app = app();
    register(&app.router, "edge-1", json!({"kind": "registered"})).await;

    let (status, body) = send(&app.router, Method::GET, "/servers", Some(ALICE), None).await;
    assert_eq!(status, StatusCode::OK);
    let listed = body["data"][0].as_object().unwrap();
    assert!(!listed.contains_key("agentTokenHash"));
    assert!(!listed.contains_key("agentToken"));
}

#[tokio::test]
async fn test_heartbeat_poll_patch_cycle() {
    let app = app();
    let (target_id, token) = register(&app.router, "edge-1", json!({"kind": "registered"})).await;
    let token = token.unwrap();

    let (status, body) = send(
        &app.router,
        Method::POST,
        &format!("/servers/{}/heartbeat", target_id),
        Some(&token),
        Some(json!({"hostname": "edge-1", "containerCount": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["health"], "connected");

    let (_, body) = send(&app.router, Method::GET, "/servers", Some(ALICE), None).await;
    assert_eq!(body["data"][0]["health"], "connected");
    assert_eq!(body["data"][0]["stats"]["hostname"], "edge-1");

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/tasks",
        Some(ALICE),
        Some(json!({"targetId": target_id, "config": task_config()})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let task_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app.router,
        Method::GET,
        &format!("/servers/{}/tasks", target_id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let polled = body["data"].as_array().unwrap();
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0]["status"], "pending");
    let version = polled[0]["version"].as_u64().unwrap();

    let (status, body) = send(
        &app.router,
        Method::PATCH,
        &format!("/servers/{}/tasks/{}", target_id, task_id),
        Some(&token),
        Some(json!({
            "status": "running",
            "containerId": "hatchery-abc123",
            "expectedVersion": version
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, body) = send(
        &app.router,
        Method::GET,
        &format!("/tasks/{}", task_id),
        Some(ALICE),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "running");
    assert_eq!(body["data"]["containerId"], "hatchery-abc123");

    // Claimed tasks are no longer offered
    let (_, body) = send(
        &app.router,
        Method::GET,
        &format!("/servers/{}/tasks", target_id),
        Some(&token),
        None,
    )
    .await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_claim_is_rejected() {
    let app = app();
    let (target_id, token) = register(&app.router, "edge-1", json!({"kind": "registered"})).await;
    let token = token.unwrap();
    let (_, body) = send(
        &app.router,
        Method::POST,
        "/tasks",
        Some(ALICE),
        Some(json!({"targetId": target_id, "config": task_config()})),
    )
    .await;
    let task_id = body["data"]["id"].as_str().unwrap().to_string();
    let version = body["data"]["version"].as_u64().unwrap();
    let uri = format!("/servers/{}/tasks/{}", target_id, task_id);

    let claim = json!({"status": "running", "expectedVersion": version});
    let (first, _) = send(&app.router, Method::PATCH, &uri, Some(&token), Some(claim.clone())).await;
    let (second, body) = send(&app.router, Method::PATCH, &uri, Some(&token), Some(claim)).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "VERSION_CONFLICT");
}

#[tokio::test]
async fn test_config_patch_is_merged() {
    let app = app();
    let (target_id, token) = register(&app.router, "edge-1", json!({"kind": "registered"})).await;
    let token = token.unwrap();
    let (_, body) = send(
        &app.router,
        Method::POST,
        "/tasks",
        Some(ALICE),
        Some(json!({"targetId": target_id, "config": task_config()})),
    )
    .await;
    let task_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app.router,
        Method::PATCH,
        &format!("/servers/{}/tasks/{}", target_id, task_id),
        Some(&token),
        Some(json!({"config": {"commit": "c0ffee1", "branch": "trunk"}})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["config"]["commit"], "c0ffee1");
    assert_eq!(body["data"]["config"]["branch"], "trunk");
    assert_eq!(body["data"]["config"]["prompt"], "fix the flaky test");
}

#[tokio::test]
async fn test_bad_agent_token_has_no_side_effects() {
    let app = app();
    let (target_id, _) = register(&app.router, "edge-1", json!({"kind": "registered"})).await;

    let (status, body) = send(
        &app.router,
        Method::POST,
        &format!("/servers/{}/heartbeat", target_id),
        Some("hat_forged"),
        Some(json!({"hostname": "mallory"})),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    let target = app.store.get_target(&target_id).await.unwrap();
    assert!(target.last_seen_at.is_none());
    assert!(target.stats.is_none());
}

#[tokio::test]
async fn test_target_cannot_patch_foreign_task() {
    let app = app();
    let (edge_a, _) = register(&app.router, "edge-a", json!({"kind": "registered"})).await;
    let (edge_b, token_b) = register(&app.router, "edge-b", json!({"kind": "registered"})).await;
    let (_, body) = send(
        &app.router,
        Method::POST,
        "/tasks",
        Some(ALICE),
        Some(json!({"targetId": edge_a, "config": task_config()})),
    )
    .await;
    let task_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app.router,
        Method::PATCH,
        &format!("/servers/{}/tasks/{}", edge_b, task_id),
        token_b.as_deref(),
        Some(json!({"status": "running"})),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    let task = app.store.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, hatchery_core::TaskStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeats_do_not_undo_forced_reregistration() {
    let app = app();
    let (id, old_token) = register(&app.router, "edge-race", json!({"kind": "registered"})).await;
    let old_token = old_token.unwrap();

    let beats: Vec<_> = (0..32)
        .map(|_| {
            let router = app.router.clone();
            let uri = format!("/servers/{}/heartbeat", id);
            let token = old_token.clone();
            tokio::spawn(async move {
                send(&router, Method::POST, &uri, Some(&token), Some(json!({"hostname": "edge"}))).await
            })
        })
        .collect();
    let (status, body) = send(
        &app.router,
        Method::POST,
        "/servers",
        Some(ALICE),
        Some(json!({"name": "edge-race", "connection": {"kind": "registered"}, "force": true})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let new_token = body["data"]["agentToken"].as_str().unwrap().to_string();
    for beat in beats {
        beat.await.unwrap();
    }

    let (status, _) = send(
        &app.router,
        Method::POST,
        &format!("/servers/{}/heartbeat", id),
        Some(&new_token),
        Some(json!({"hostname": "edge"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &app.router,
        Method::POST,
        &format!("/servers/{}/heartbeat", id),
        Some(&old_token),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
