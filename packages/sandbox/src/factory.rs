// ABOUTME: Maps a persisted compute target onto a concrete container provider
// ABOUTME: Registered targets are refused since their lifecycle is driven by the remote process

use crate::providers::{
    ClusterConfig, ClusterProvider, ContainerProvider, DockerProvider, ProviderError,
    TunneledDockerProvider,
};
use crate::tunnel::TunnelConfig;
use hatchery_core::{ComputeTarget, TargetConnection};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("Target {0} is a registered target; its sandboxes are driven by the remote process")]
    Registered(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Build a provider bound to `target`.
///
/// Tunneled targets pointing at this host skip the tunnel and talk to the
/// remote socket path directly.
pub fn provider_for_target(
    target: &ComputeTarget,
) -> Result<Arc<dyn ContainerProvider>, FactoryError> {
    let provider: Arc<dyn ContainerProvider> = match &target.connection {
        TargetConnection::Direct { socket_path } => match socket_path {
            Some(path) => Arc::new(DockerProvider::with_socket(path)?),
            None => Arc::new(DockerProvider::new()?),
        },
        TargetConnection::Tunneled {
            host,
            remote_socket,
            ..
        } if is_loopback(host) => {
            debug!(target_id = %target.id, "Loopback tunnel target, using local socket");
            Arc::new(DockerProvider::with_socket(remote_socket)?)
        }
        TargetConnection::Tunneled {
            host,
            port,
            username,
            auth,
            remote_socket,
            host_key_fingerprint,
        } => {
            let mut config = TunnelConfig::new(host.clone(), username.clone(), auth.clone());
            config.port = *port;
            config.remote_socket = remote_socket.clone();
            config.host_key_fingerprint = host_key_fingerprint.clone();
            Arc::new(TunneledDockerProvider::new(config))
        }
        TargetConnection::Cluster {
            api_server,
            token,
            namespace,
            ca_cert_pem,
            storage_class,
            volume_size,
        } => {
            let mut config = ClusterConfig::new(api_server.clone(), token.clone());
            config.namespace = namespace.clone();
            config.ca_cert_pem = ca_cert_pem.clone();
            config.storage_class = storage_class.clone();
            config.volume_size = volume_size.clone();
            Arc::new(ClusterProvider::new(config)?)
        }
        TargetConnection::Registered => return Err(FactoryError::Registered(target.id.clone())),
    };

    debug!(target_id = %target.id, kind = %target.kind(), "Resolved provider for target");
    Ok(provider)
}

fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}
