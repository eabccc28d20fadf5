// ABOUTME: Host stats carried by each heartbeat
// ABOUTME: Collection never fails; unavailable values are left empty

use hatchery_sandbox::ContainerProvider;
use serde::Serialize;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    pub hostname: String,
    pub daemon_version: Option<String>,
    pub daemon_healthy: bool,
    pub managed_containers: usize,
    pub running_containers: usize,
    pub uptime_secs: u64,
    pub worker_version: String,
}

pub async fn collect(provider: &dyn ContainerProvider, started_at: Instant) -> HostStats {
    let hostname = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let health = provider.health_check().await;
    let (managed, running) = match provider.list_containers().await {
        Ok(containers) => {
            let running = containers
                .iter()
                .filter(|c| c.status == hatchery_sandbox::ContainerStatus::Running)
                .count();
            (containers.len(), running)
        }
        Err(e) => {
            debug!("Could not list containers for heartbeat: {}", e);
            (0, 0)
        }
    };

    HostStats {
        hostname,
        daemon_version: health.version,
        daemon_healthy: health.healthy,
        managed_containers: managed,
        running_containers: running,
        uptime_secs: started_at.elapsed().as_secs(),
        worker_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}
