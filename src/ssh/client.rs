//! SSH handshake, host-key verification, and authentication (§4.2).
//!
//! Two connect entry points share one handler and one authenticate routine: a fresh TCP
//! dial (`connect`) and a connect over an existing stream (`connect_via_stream`), the
//! latter used for SSH-over-SSH when chaining through a jump host — the transport is a
//! `russh::ChannelStream` wrapping a `direct-tcpip` channel opened on the jump's own
//! connection.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::ChannelStream;
use tracing::{debug, info, warn};

use super::keys;
use super::known_hosts::{get_known_hosts, HostKeyVerification};
use crate::config::{AuthMethod, EndpointConfig, HostKeyPolicy};
use crate::error::{AuthKind, Hop, TunnelError};

fn ssh_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Connect over a fresh TCP dial and authenticate.
pub async fn connect(
    endpoint: &EndpointConfig,
    policy: HostKeyPolicy,
    hop: Hop,
    timeout_secs: u64,
) -> Result<Handle<ClientHandler>, TunnelError> {
    let addr = format!("{}:{}", endpoint.host, endpoint.port);
    info!("connecting to {} host {}", hop, addr);

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| TunnelError::ConnectionFailed { hop, reason: format!("resolving {addr}: {e}") })?
        .next()
        .ok_or_else(|| TunnelError::ConnectionFailed { hop, reason: format!("no address found for {addr}") })?;

    let handler = ClientHandler::new(endpoint.host.clone(), endpoint.port, policy, hop);

    let mut handle = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        client::connect(ssh_config(), socket_addr, handler),
    )
    .await
    .map_err(|_| TunnelError::Timeout { hop, reason: format!("connecting to {addr}") })?
    .map_err(|e| TunnelError::ConnectionFailed { hop, reason: e.to_string() })?;

    debug!("{} ssh handshake completed", hop);
    authenticate(&mut handle, endpoint, hop).await?;
    info!("{} ssh authentication succeeded", hop);
    Ok(handle)
}

/// Connect over an already-established stream (SSH-over-SSH for jump chaining).
pub async fn connect_via_stream(
    endpoint: &EndpointConfig,
    stream: ChannelStream<client::Msg>,
    policy: HostKeyPolicy,
    hop: Hop,
    timeout_secs: u64,
) -> Result<Handle<ClientHandler>, TunnelError> {
    info!("connecting to {} host {}:{} over a nested ssh stream", hop, endpoint.host, endpoint.port);
    let handler = ClientHandler::new(endpoint.host.clone(), endpoint.port, policy, hop);

    let mut handle = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        client::connect_stream(ssh_config(), stream, handler),
    )
    .await
    .map_err(|_| TunnelError::Timeout {
        hop,
        reason: format!("connecting to {}:{} via stream", endpoint.host, endpoint.port),
    })?
    .map_err(|e| TunnelError::ConnectionFailed { hop, reason: e.to_string() })?;

    debug!("{} ssh handshake via stream completed", hop);
    authenticate(&mut handle, endpoint, hop).await?;
    info!("{} ssh authentication succeeded", hop);
    Ok(handle)
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    endpoint: &EndpointConfig,
    hop: Hop,
) -> Result<(), TunnelError> {
    let authenticated = match &endpoint.auth {
        AuthMethod::Password { password } => handle
            .authenticate_password(&endpoint.username, password)
            .await
            .map_err(|e| TunnelError::AuthenticationFailed { hop, mode: AuthKind::Password, reason: e.to_string() })?,
        AuthMethod::Key { key_path, passphrase } => {
            let key = keys::load(key_path, passphrase.as_deref())?;
            let key_with_hash = keys::with_hash_alg(key);
            handle
                .authenticate_publickey(&endpoint.username, key_with_hash)
                .await
                .map_err(|e| TunnelError::AuthenticationFailed { hop, mode: AuthKind::Key, reason: e.to_string() })?
        }
    };

    if !authenticated.success() {
        return Err(TunnelError::AuthenticationFailed {
            hop,
            mode: endpoint.auth.kind(),
            reason: "rejected by server".to_string(),
        });
    }
    Ok(())
}

/// `russh::client::Handler` for TOFU/strict host-key verification (§4.2). Carries the
/// hop it belongs to purely so a rejected handshake can be attributed correctly.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    hop: Hop,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy, hop: Hop) -> Self {
        Self { host, port, policy, hop }
    }
}

impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let known_hosts = get_known_hosts();
        let verification = known_hosts.verify(&self.host, self.port, server_public_key);

        match verification {
            HostKeyVerification::Verified => {
                info!("host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                info!(
                    "new host {}:{}, trusting on first use (fingerprint {})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = known_hosts.add_host(&self.host, self.port, server_public_key) {
                    warn!("failed to persist host key for {}:{}: {}", self.host, self.port, e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed { expected_fingerprint, actual_fingerprint } => match self.policy {
                HostKeyPolicy::Verify => {
                    warn!(
                        "host key for {}:{} changed (expected {}, got {}), rejecting under strict policy",
                        self.host, self.port, expected_fingerprint, actual_fingerprint
                    );
                    Err(TunnelError::ConnectionFailed {
                        hop: self.hop,
                        reason: format!(
                            "host key for {}:{} changed: expected {}, got {}",
                            self.host, self.port, expected_fingerprint, actual_fingerprint
                        ),
                    })
                }
                HostKeyPolicy::AutoAdd => {
                    warn!(
                        "host key for {}:{} changed (expected {}, got {}) but auto-add policy accepts it",
                        self.host, self.port, expected_fingerprint, actual_fingerprint
                    );
                    Ok(true)
                }
            },
        }
    }
}
