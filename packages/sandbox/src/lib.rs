// ABOUTME: Container providers, SSH tunnel and sandbox lifecycle management
// ABOUTME: One provider contract over a local daemon, a tunneled daemon and a cluster API

pub mod factory;
pub mod manager;
pub mod providers;
pub mod tunnel;
pub mod volumes;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use factory::{provider_for_target, FactoryError};
pub use manager::{CreateSandboxRequest, ManagerError, SandboxInspection, SandboxManager};
pub use providers::{
    ClusterConfig, ClusterProvider, ContainerInspection, ContainerProvider, ContainerSpec,
    ContainerStatus, ContainerSummary, CreatedContainer, DockerProvider, ExecOutput, HealthReport,
    ProviderError, ResourceUsage, TunneledDockerProvider, VolumeFilter, VolumeInfo,
    TRANSPORT_FAILURE_EXIT_CODE,
};
pub use tunnel::{BackoffPolicy, SshTunnel, TunnelConfig, TunnelError, TunnelState};
pub use volumes::{OrphanVolume, PruneReport, VolumeManager};
