// ABOUTME: Helpers for the `hatchery volumes` command
// ABOUTME: A volume is known when a managed unit still references its sandbox or it is kept explicitly

use comfy_table::{presets::UTF8_FULL, Table};
use hatchery_sandbox::{ContainerProvider, OrphanVolume, PruneReport, ProviderError};
use std::collections::HashSet;

/// Sandbox ids that still own a compute unit on the target, plus `keep`
pub async fn known_sandbox_ids(
    provider: &dyn ContainerProvider,
    keep: &[String],
) -> Result<HashSet<String>, ProviderError> {
    let mut known: HashSet<String> = keep.iter().map(|id| id.to_lowercase()).collect();
    for container in provider.list_containers().await? {
        if let Some(sandbox_id) = container.sandbox_id {
            known.insert(sandbox_id.to_lowercase());
        }
    }
    Ok(known)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn orphan_table(orphans: &[OrphanVolume]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Volume", "Sandbox", "Size", "In use"]);
    for orphan in orphans {
        table.add_row(vec![
            orphan.name.clone(),
            orphan.sandbox_id.clone(),
            format_bytes(orphan.size_bytes),
            if orphan.in_use { "yes" } else { "no" }.to_string(),
        ]);
    }
    table
}

pub fn prune_summary(report: &PruneReport) -> String {
    let mut lines = vec![format!(
        "Removed {} volume(s), reclaimed {}",
        report.removed.len(),
        format_bytes(report.reclaimed_bytes)
    )];
    if !report.skipped_in_use.is_empty() {
        lines.push(format!("Skipped (in use): {}", report.skipped_in_use.join(", ")));
    }
    for (name, error) in &report.failed {
        lines.push(format!("Failed {}: {}", name, error));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_prune_summary_lists_skips_and_failures() {
        let report = PruneReport {
            removed: vec!["hatchery-vol-a".to_string()],
            skipped_in_use: vec!["hatchery-vol-b".to_string()],
            failed: vec![("hatchery-vol-c".to_string(), "permission denied".to_string())],
            reclaimed_bytes: 2048,
        };
        let summary = prune_summary(&report);
        assert!(summary.starts_with("Removed 1 volume(s), reclaimed 2.0 KiB"));
        assert!(summary.contains("Skipped (in use): hatchery-vol-b"));
        assert!(summary.contains("Failed hatchery-vol-c: permission denied"));
    }
}
