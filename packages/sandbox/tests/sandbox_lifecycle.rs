// ABOUTME: Integration tests for the sandbox lifecycle against a real Docker daemon
// ABOUTME: Skips itself when no daemon is reachable

use hatchery_core::{MemoryStore, ResourceLimits, SandboxStatus};
use hatchery_sandbox::{
    ContainerProvider, ContainerStatus, CreateSandboxRequest, DockerProvider, SandboxManager,
    VolumeManager,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Docker provider when a daemon answers, None otherwise
async fn docker() -> Option<Arc<DockerProvider>> {
    let provider = DockerProvider::new().ok()?;
    if provider.health_check().await.healthy {
        Some(Arc::new(provider))
    } else {
        None
    }
}

fn request() -> CreateSandboxRequest {
    CreateSandboxRequest {
        target_id: "local".to_string(),
        image: Some("alpine:latest".to_string()),
        env: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
        limits: ResourceLimits {
            memory_bytes: 256 * 1024 * 1024,
            cpu_count: 0.5,
        },
    }
}

/// create → start → exec → stop → start → remove → inspect
#[tokio::test]
async fn test_complete_sandbox_lifecycle() {
    let Some(provider) = docker().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    let manager = SandboxManager::new(Arc::new(MemoryStore::new()), provider.clone());

    let sandbox = manager.create_sandbox(request()).await.unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Running);
    let container_id = sandbox.container_id.clone().unwrap();

    let out = provider
        .execute_command(
            &container_id,
            &["sh".to_string(), "-c".to_string(), "echo $GREETING $EXTRA; exit 3".to_string()],
            &HashMap::from([("EXTRA".to_string(), "world".to_string())]),
        )
        .await;
    assert_eq!(out.exit_code, 3);
    assert!(out.output.contains("hello world"));

    let stopped = manager.stop_sandbox(&sandbox.id).await.unwrap();
    assert_eq!(stopped.status, SandboxStatus::Stopped);
    manager.stop_sandbox(&sandbox.id).await.unwrap();

    let running = manager.start_sandbox(&sandbox.id).await.unwrap();
    assert_eq!(running.status, SandboxStatus::Running);
    manager.start_sandbox(&sandbox.id).await.unwrap();

    let inspection = manager.inspect_sandbox(&sandbox.id).await.unwrap();
    assert_eq!(inspection.container.status, ContainerStatus::Running);
    assert!(inspection.container.uptime_secs.is_some());

    manager.remove_sandbox(&sandbox.id, false).await.unwrap();
    let gone = provider.inspect_container(&container_id).await.unwrap();
    assert_eq!(gone.status, ContainerStatus::NotFound);
}

/// Re-creating the same sandbox reuses the existing container
#[tokio::test]
async fn test_create_is_defensive_about_existing_container() {
    let Some(provider) = docker().await else {
        println!("Skipping test: Docker not available");
        return;
    };

    let sandbox_id = format!("it{}", hatchery_core::utils::generate_id().to_lowercase());
    let spec = hatchery_sandbox::ContainerSpec {
        image: "alpine:latest".to_string(),
        ..Default::default()
    };

    let first = provider.create_container(&sandbox_id, &spec).await.unwrap();
    let second = provider.create_container(&sandbox_id, &spec).await.unwrap();
    assert_eq!(first, second);

    provider
        .remove_container(&first.container_id, Some(&first.volume_id), false)
        .await
        .unwrap();
}

/// A volume left behind by a removed sandbox is reported and pruned
#[tokio::test]
async fn test_orphan_volume_is_pruned() {
    let Some(provider) = docker().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    let manager = SandboxManager::new(Arc::new(MemoryStore::new()), provider.clone());

    let sandbox = manager.create_sandbox(request()).await.unwrap();
    let volume = sandbox.volume_id.clone().unwrap();
    manager.remove_sandbox(&sandbox.id, true).await.unwrap();

    let volumes = VolumeManager::new(provider.clone());
    let orphans = volumes.find_orphans(&HashSet::new()).await.unwrap();
    assert!(orphans.iter().any(|o| o.name == volume));

    let known = manager.volume_owners("local").await.unwrap();
    assert!(known.contains(&sandbox.id));

    provider.delete_volume(&volume).await.unwrap();
    let orphans = volumes.find_orphans(&HashSet::new()).await.unwrap();
    assert!(!orphans.iter().any(|o| o.name == volume));
}
