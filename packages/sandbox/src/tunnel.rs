// ABOUTME: SSH tunnel forwarding a local TCP listener to a remote Unix socket
// ABOUTME: Keeps one session per tunnel and reconnects with capped doubling backoff after unexpected closes

use async_trait::async_trait;
use hatchery_core::constants::DEFAULT_DOCKER_SOCKET;
use hatchery_core::SshAuth;
use russh::client;
use russh_keys::key;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("SSH connection failed: {0}")]
    Connect(String),

    #[error("SSH authentication rejected for user {0}")]
    AuthRejected(String),

    #[error("Host key mismatch: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Failed to open forwarded channel: {0}")]
    Channel(String),

    #[error("Local listener error: {0}")]
    Listener(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Tunnel has been disconnected")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Observable tunnel lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected { local_port: u16 },
    Reconnecting { attempt: u32, delay: Duration },
    Closed,
}

/// Doubling delay sequence with an upper bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Position in the backoff sequence; reset after every successful reconnect
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, advancing the sequence
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        let delay = self
            .policy
            .initial
            .checked_mul(factor)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Byte stream forwarded to the remote socket
pub trait ForwardIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ForwardIo for T {}

pub type ForwardedStream = Box<dyn ForwardIo>;

/// Opens sessions to the remote host
#[async_trait]
pub trait TunnelTransport: Send + Sync + 'static {
    async fn open_session(&self) -> Result<Arc<dyn TunnelSession>>;
}

/// One established multiplexed session
#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Open a new channel to the remote socket
    async fn open_stream(&self) -> Result<ForwardedStream>;

    /// Resolves once the session has gone away
    async fn closed(&self);

    async fn close(&self);
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    pub remote_socket: String,
    /// Expected `SHA256:` fingerprint of the host key; unpinned when absent
    pub host_key_fingerprint: Option<String>,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Give up after this many failed reconnect attempts; retry forever when absent
    pub max_reconnect_attempts: Option<u32>,
}

impl TunnelConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth,
            remote_socket: DEFAULT_DOCKER_SOCKET.to_string(),
            host_key_fingerprint: None,
            connect_timeout: Duration::from_secs(15),
            backoff: BackoffPolicy::default(),
            max_reconnect_attempts: None,
        }
    }
}

/// Forwards local TCP connections over one SSH session to a remote Unix socket
pub struct SshTunnel {
    inner: Arc<TunnelInner>,
}

struct TunnelInner {
    transport: Arc<dyn TunnelTransport>,
    connect_timeout: Duration,
    backoff: BackoffPolicy,
    max_reconnect_attempts: Option<u32>,
    state: watch::Sender<TunnelState>,
    cancel: CancellationToken,
    /// Serializes connect() so only one supervisor ever runs
    connect_lock: Mutex<()>,
    supervising: AtomicBool,
}

impl SshTunnel {
    /// Tunnel over a real SSH connection
    pub fn new(config: TunnelConfig) -> Self {
        let connect_timeout = config.connect_timeout;
        let backoff = config.backoff;
        let max_attempts = config.max_reconnect_attempts;
        Self::with_transport(
            Arc::new(SshTransport::new(config)),
            connect_timeout,
            backoff,
            max_attempts,
        )
    }

    pub fn with_transport(
        transport: Arc<dyn TunnelTransport>,
        connect_timeout: Duration,
        backoff: BackoffPolicy,
        max_reconnect_attempts: Option<u32>,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::Disconnected);
        Self {
            inner: Arc::new(TunnelInner {
                transport,
                connect_timeout,
                backoff,
                max_reconnect_attempts,
                state,
                cancel: CancellationToken::new(),
                connect_lock: Mutex::new(()),
                supervising: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.inner.state.subscribe()
    }

    pub fn local_port(&self) -> Option<u16> {
        match self.state() {
            TunnelState::Connected { local_port } => Some(local_port),
            _ => None,
        }
    }

    /// Establish the session and local listener, returning the local port.
    ///
    /// Blocks until both are ready. Returns the current port when already
    /// connected.
    pub async fn connect(&self) -> Result<u16> {
        let _guard = self.inner.connect_lock.lock().await;

        match self.state() {
            TunnelState::Closed => return Err(TunnelError::Closed),
            TunnelState::Connected { local_port } => return Ok(local_port),
            _ if self.inner.supervising.load(Ordering::SeqCst) => {
                drop(_guard);
                return self.wait_connected().await;
            }
            _ => {}
        }

        self.inner.set_state(TunnelState::Connecting);
        let session = match self.inner.open_session().await {
            Ok(session) => session,
            Err(e) => {
                self.inner.set_state(TunnelState::Disconnected);
                return Err(e);
            }
        };

        let listener = match bind_listener(None).await {
            Ok(listener) => listener,
            Err(e) => {
                session.close().await;
                self.inner.set_state(TunnelState::Disconnected);
                return Err(e.into());
            }
        };
        let local_port = listener.local_addr()?.port();

        // A disconnect() racing with the handshake wins
        if self.inner.cancel.is_cancelled() {
            session.close().await;
            return Err(TunnelError::Closed);
        }

        self.inner.set_state(TunnelState::Connected { local_port });
        info!(local_port, "SSH tunnel connected");

        self.inner.supervising.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Arc::clone(&inner).supervise(session, listener).await;
            inner.supervising.store(false, Ordering::SeqCst);
        });

        Ok(local_port)
    }

    /// Wait until the tunnel is connected again, or fails terminally
    pub async fn wait_connected(&self) -> Result<u16> {
        let mut rx = self.subscribe();
        loop {
            match rx.borrow_and_update().clone() {
                TunnelState::Connected { local_port } => return Ok(local_port),
                TunnelState::Closed => return Err(TunnelError::Closed),
                TunnelState::Disconnected => {
                    return Err(TunnelError::Connect("tunnel is not connected".to_string()))
                }
                TunnelState::Connecting | TunnelState::Reconnecting { .. } => {}
            }
            if rx.changed().await.is_err() {
                return Err(TunnelError::Closed);
            }
        }
    }

    /// Terminal shutdown; safe from any state and never blocks
    pub fn disconnect(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.set_state(TunnelState::Closed);
        info!("SSH tunnel disconnected");
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl TunnelInner {
    fn set_state(&self, state: TunnelState) {
        // Closed is terminal
        self.state.send_if_modified(|current| {
            if *current == TunnelState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn open_session(&self) -> Result<Arc<dyn TunnelSession>> {
        match tokio::time::timeout(self.connect_timeout, self.transport.open_session()).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Timeout(self.connect_timeout)),
        }
    }

    /// Owns the listener and session until cancelled or reconnects are exhausted
    async fn supervise(self: Arc<Self>, mut session: Arc<dyn TunnelSession>, mut listener: TcpListener) {
        let mut backoff = ReconnectBackoff::new(self.backoff);

        loop {
            let port = listener.local_addr().ok().map(|addr| addr.port());
            let generation = self.cancel.child_token();

            let cancelled = tokio::select! {
                _ = self.cancel.cancelled() => true,
                _ = accept_loop(&listener, Arc::clone(&session), generation.clone()) => false,
                _ = session.closed() => {
                    warn!("SSH session closed unexpectedly");
                    false
                }
            };

            // Release the listener before anything else can be bound
            generation.cancel();
            drop(listener);

            if cancelled {
                session.close().await;
                return;
            }

            let reconnected = self.reconnect(&mut backoff, port).await;
            match reconnected {
                Some((new_session, new_listener)) => {
                    session = new_session;
                    listener = new_listener;
                    backoff.reset();
                }
                None => return,
            }
        }
    }

    async fn reconnect(
        &self,
        backoff: &mut ReconnectBackoff,
        preferred_port: Option<u16>,
    ) -> Option<(Arc<dyn TunnelSession>, TcpListener)> {
        loop {
            if let Some(max) = self.max_reconnect_attempts {
                if backoff.attempt() >= max {
                    warn!(attempts = max, "Giving up on SSH tunnel reconnect");
                    self.set_state(TunnelState::Disconnected);
                    return None;
                }
            }

            let delay = backoff.next_delay();
            let attempt = backoff.attempt();
            self.set_state(TunnelState::Reconnecting { attempt, delay });
            debug!(attempt, ?delay, "Scheduling SSH tunnel reconnect");

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            self.set_state(TunnelState::Connecting);
            let session = match self.open_session().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(attempt, "SSH tunnel reconnect failed: {}", e);
                    continue;
                }
            };

            let listener = match bind_listener(preferred_port).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("Failed to bind tunnel listener: {}", e);
                    session.close().await;
                    continue;
                }
            };

            if self.cancel.is_cancelled() {
                session.close().await;
                return None;
            }

            if let Ok(addr) = listener.local_addr() {
                self.set_state(TunnelState::Connected {
                    local_port: addr.port(),
                });
                info!(local_port = addr.port(), attempt, "SSH tunnel reconnected");
            }
            return Some((session, listener));
        }
    }
}

/// Bind on loopback, reusing the previous port when it is still free
async fn bind_listener(preferred_port: Option<u16>) -> std::io::Result<TcpListener> {
    if let Some(port) = preferred_port {
        if let Ok(listener) = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await {
            return Ok(listener);
        }
    }
    TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await
}

async fn accept_loop(
    listener: &TcpListener,
    session: Arc<dyn TunnelSession>,
    generation: CancellationToken,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Tunnel listener accept failed: {}", e);
                return;
            }
        };
        debug!(%peer, "Forwarding tunnel connection");

        let session = Arc::clone(&session);
        let generation = generation.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = generation.cancelled() => {}
                result = forward(socket, session) => {
                    if let Err(e) = result {
                        debug!(%peer, "Tunnel connection ended: {}", e);
                    }
                }
            }
        });
    }
}

/// Pipe bytes both ways; either side closing tears down the other
async fn forward(mut socket: TcpStream, session: Arc<dyn TunnelSession>) -> Result<()> {
    let mut remote = session.open_stream().await?;
    tokio::io::copy_bidirectional(&mut socket, &mut remote).await?;
    Ok(())
}

/// russh-backed transport
pub struct SshTransport {
    config: TunnelConfig,
}

impl SshTransport {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }
}

struct HostKeyCheck {
    expected: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let actual = server_public_key.fingerprint();
        match &self.expected {
            None => {
                warn!(fingerprint = %actual, "Accepting unpinned SSH host key");
                Ok(true)
            }
            Some(expected) => {
                let matches = expected.trim_start_matches("SHA256:") == actual;
                if !matches {
                    warn!(expected = %expected, actual = %actual, "SSH host key mismatch");
                }
                Ok(matches)
            }
        }
    }
}

struct SshSession {
    handle: client::Handle<HostKeyCheck>,
    remote_socket: String,
}

#[async_trait]
impl TunnelTransport for SshTransport {
    async fn open_session(&self) -> Result<Arc<dyn TunnelSession>> {
        let config = client::Config {
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        };
        let handler = HostKeyCheck {
            expected: self.config.host_key_fingerprint.clone(),
        };

        let mut handle = client::connect(
            Arc::new(config),
            (self.config.host.as_str(), self.config.port),
            handler,
        )
        .await
        .map_err(|e| match (&self.config.host_key_fingerprint, e) {
            (Some(expected), russh::Error::UnknownKey) => TunnelError::HostKeyMismatch {
                expected: expected.clone(),
                actual: "unrecognized".to_string(),
            },
            (_, e) => TunnelError::Connect(e.to_string()),
        })?;

        let authenticated = match &self.config.auth {
            SshAuth::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| TunnelError::Connect(e.to_string()))?,
            SshAuth::PrivateKey {
                private_key_pem,
                passphrase,
            } => {
                let key_pair = russh_keys::decode_secret_key(private_key_pem, passphrase.as_deref())
                    .map_err(|e| TunnelError::InvalidKey(e.to_string()))?;
                handle
                    .authenticate_publickey(&self.config.username, Arc::new(key_pair))
                    .await
                    .map_err(|e| TunnelError::Connect(e.to_string()))?
            }
        };

        if !authenticated {
            return Err(TunnelError::AuthRejected(self.config.username.clone()));
        }

        debug!(host = %self.config.host, "SSH session established");
        Ok(Arc::new(SshSession {
            handle,
            remote_socket: self.config.remote_socket.clone(),
        }))
    }
}

#[async_trait]
impl TunnelSession for SshSession {
    async fn open_stream(&self) -> Result<ForwardedStream> {
        let channel = self
            .handle
            .channel_open_direct_streamlocal(self.remote_socket.clone())
            .await
            .map_err(|e| TunnelError::Channel(e.to_string()))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn closed(&self) {
        while !self.handle.is_closed() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("SSH disconnect: {}", e);
        }
    }
}
