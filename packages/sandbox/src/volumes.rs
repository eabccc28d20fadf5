// ABOUTME: Orphan volume detection and cleanup for a single compute target
// ABOUTME: Cross-references sandbox volumes on the backend against the known sandbox ids

use crate::providers::{ContainerProvider, Result, VolumeFilter, VolumeInfo};
use hatchery_core::constants::{sandbox_id_from_volume, VOLUME_PREFIX};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// A sandbox volume with no matching sandbox record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanVolume {
    pub name: String,
    pub sandbox_id: String,
    pub size_bytes: u64,
    pub in_use: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub removed: Vec<String>,
    /// Orphans still mounted by a running unit
    pub skipped_in_use: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub reclaimed_bytes: u64,
}

pub struct VolumeManager {
    provider: Arc<dyn ContainerProvider>,
}

impl VolumeManager {
    pub fn new(provider: Arc<dyn ContainerProvider>) -> Self {
        Self { provider }
    }

    /// All volumes following the sandbox naming convention
    pub async fn list_sandbox_volumes(&self) -> Result<Vec<VolumeInfo>> {
        self.provider
            .list_volumes(&VolumeFilter::with_prefix(VOLUME_PREFIX))
            .await
    }

    /// Sandbox volumes whose sandbox id is not in `known_sandbox_ids`
    pub async fn find_orphans(&self, known_sandbox_ids: &HashSet<String>) -> Result<Vec<OrphanVolume>> {
        let mut orphans = Vec::new();

        for volume in self.list_sandbox_volumes().await? {
            let Some(sandbox_id) = sandbox_id_from_volume(&volume.name) else {
                continue;
            };
            if known_sandbox_ids.contains(sandbox_id) {
                continue;
            }

            let size_bytes = self.provider.get_volume_size(&volume.name).await.unwrap_or(0);
            let in_use = self.provider.is_volume_in_use(&volume.name).await?;
            orphans.push(OrphanVolume {
                sandbox_id: sandbox_id.to_string(),
                name: volume.name,
                size_bytes,
                in_use,
            });
        }

        Ok(orphans)
    }

    /// Remove orphaned volumes, skipping any still mounted
    pub async fn remove_orphans(&self, known_sandbox_ids: &HashSet<String>) -> Result<PruneReport> {
        let mut report = PruneReport::default();

        for orphan in self.find_orphans(known_sandbox_ids).await? {
            if orphan.in_use {
                warn!(volume = %orphan.name, "Orphan volume still mounted, skipping");
                report.skipped_in_use.push(orphan.name);
                continue;
            }

            match self.provider.delete_volume(&orphan.name).await {
                Ok(()) => {
                    info!(volume = %orphan.name, bytes = orphan.size_bytes, "Removed orphan volume");
                    report.reclaimed_bytes += orphan.size_bytes;
                    report.removed.push(orphan.name);
                }
                Err(e) => {
                    warn!(volume = %orphan.name, "Failed to remove orphan volume: {}", e);
                    report.failed.push((orphan.name, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryProvider;
    use std::collections::HashMap;

    async fn seeded() -> Arc<InMemoryProvider> {
        let provider = Arc::new(InMemoryProvider::new());
        for name in ["hatchery-vol-live", "hatchery-vol-dead", "hatchery-vol-busy", "pgdata"] {
            provider.create_volume(name, &HashMap::new()).await.unwrap();
        }
        provider.set_volume_size("hatchery-vol-dead", 4096);
        provider.mark_volume_in_use("hatchery-vol-busy");
        provider
    }

    #[tokio::test]
    async fn test_find_orphans_ignores_known_and_foreign_volumes() {
        let provider = seeded().await;
        let manager = VolumeManager::new(provider);
        let known = HashSet::from(["live".to_string()]);

        let mut orphans = manager.find_orphans(&known).await.unwrap();
        orphans.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<_> = orphans.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["hatchery-vol-busy", "hatchery-vol-dead"]);
        assert_eq!(orphans[1].sandbox_id, "dead");
        assert_eq!(orphans[1].size_bytes, 4096);
        assert!(orphans[0].in_use);
    }

    #[tokio::test]
    async fn test_remove_orphans_skips_in_use() {
        let provider = seeded().await;
        let manager = VolumeManager::new(provider.clone());
        let known = HashSet::from(["live".to_string()]);

        let report = manager.remove_orphans(&known).await.unwrap();
        assert_eq!(report.removed, vec!["hatchery-vol-dead".to_string()]);
        assert_eq!(report.skipped_in_use, vec!["hatchery-vol-busy".to_string()]);
        assert_eq!(report.reclaimed_bytes, 4096);

        let remaining: Vec<_> = provider
            .list_volumes(&VolumeFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert!(remaining.contains(&"hatchery-vol-live".to_string()));
        assert!(remaining.contains(&"pgdata".to_string()));
        assert!(!remaining.contains(&"hatchery-vol-dead".to_string()));
    }

    #[tokio::test]
    async fn test_delete_failures_are_reported() {
        let provider = seeded().await;
        provider.fail_volume_deletes(true);
        let manager = VolumeManager::new(provider);

        let report = manager.remove_orphans(&HashSet::new()).await.unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.failed.len(), 2);
    }
}
