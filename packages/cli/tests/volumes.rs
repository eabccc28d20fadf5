// ABOUTME: Orphan detection as the volumes command performs it, against the in-memory provider
// ABOUTME: Units still present keep their volumes; --keep ids are honored

use hatchery_cli::volumes::{known_sandbox_ids, orphan_table};
use hatchery_sandbox::testing::InMemoryProvider;
use hatchery_sandbox::{ContainerProvider, ContainerSpec, VolumeManager};
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn test_units_and_kept_ids_protect_volumes() {
    let provider = Arc::new(InMemoryProvider::new());
    provider
        .create_container("live", &ContainerSpec::default())
        .await
        .unwrap();
    for name in ["hatchery-vol-dead", "hatchery-vol-pinned", "postgres-data"] {
        provider.create_volume(name, &HashMap::new()).await.unwrap();
    }

    let known = known_sandbox_ids(provider.as_ref(), &["pinned".to_string()])
        .await
        .unwrap();
    assert!(known.contains("live"));

    let manager = VolumeManager::new(provider.clone());
    let orphans = manager.find_orphans(&known).await.unwrap();
    let names: Vec<_> = orphans.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["hatchery-vol-dead"]);

    let rendered = orphan_table(&orphans).to_string();
    assert!(rendered.contains("hatchery-vol-dead"));

    let report = manager.remove_orphans(&known).await.unwrap();
    assert_eq!(report.removed, vec!["hatchery-vol-dead".to_string()]);
    assert!(provider.has_volume("hatchery-vol-live"));
    assert!(provider.has_volume("hatchery-vol-pinned"));
}
