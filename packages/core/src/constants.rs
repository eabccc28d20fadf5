// ABOUTME: Naming conventions and label keys shared across Hatchery packages
// ABOUTME: Keeps container, volume and label names consistent between backends

/// Default path of the container daemon socket
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Label carrying the owning sandbox id on containers, pods, volumes and claims
pub const LABEL_SANDBOX_ID: &str = "hatchery.sandbox-id";

/// Label carrying the volume name on the compute unit
pub const LABEL_VOLUME: &str = "hatchery.volume";

/// Label marking resources created by Hatchery
pub const LABEL_MANAGED: &str = "hatchery.managed";

/// Prefix of every volume created for a sandbox
pub const VOLUME_PREFIX: &str = "hatchery-vol-";

/// Prefix of every compute unit created for a sandbox
pub const CONTAINER_PREFIX: &str = "hatchery-";

/// Mount point of the sandbox volume inside the compute unit
pub const WORKSPACE_DIR: &str = "/workspace";

/// Name of the volume owned by a sandbox
pub fn volume_name(sandbox_id: &str) -> String {
    format!("{}{}", VOLUME_PREFIX, sandbox_id.to_lowercase())
}

/// Name of the compute unit owned by a sandbox
pub fn container_name(sandbox_id: &str) -> String {
    format!("{}{}", CONTAINER_PREFIX, sandbox_id.to_lowercase())
}

/// Recover the sandbox id from a volume name following the convention
pub fn sandbox_id_from_volume(volume: &str) -> Option<&str> {
    volume
        .strip_prefix(VOLUME_PREFIX)
        .filter(|rest| !rest.is_empty())
}

/// Recover the sandbox id from a compute unit name following the convention
pub fn sandbox_id_from_container(name: &str) -> Option<&str> {
    name.trim_start_matches('/')
        .strip_prefix(CONTAINER_PREFIX)
        .filter(|rest| !rest.is_empty() && !rest.starts_with("vol-"))
}

/// Annotation on a volume claim holding the pod manifest used to recreate the pod
pub const ANNOTATION_POD_TEMPLATE: &str = "hatchery.pod-template";

/// Age after which inspect requests are dropped, pending or resolved
pub const INSPECT_RETENTION_SECS: i64 = 300;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_name_roundtrip() {
        let name = volume_name("abc123");
        assert_eq!(name, "hatchery-vol-abc123");
        assert_eq!(sandbox_id_from_volume(&name), Some("abc123"));
    }

    #[test]
    fn test_foreign_volume_has_no_sandbox() {
        assert_eq!(sandbox_id_from_volume("postgres-data"), None);
        assert_eq!(sandbox_id_from_volume("hatchery-vol-"), None);
    }

    #[test]
    fn test_container_name_roundtrip() {
        assert_eq!(sandbox_id_from_container("/hatchery-abc"), Some("abc"));
        assert_eq!(sandbox_id_from_container("hatchery-vol-abc"), None);
        assert_eq!(sandbox_id_from_container("nginx"), None);
    }

    #[test]
    fn test_names_are_lowercase() {
        assert_eq!(container_name("AbC"), "hatchery-abc");
    }
}
