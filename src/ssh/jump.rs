//! ProxyJump chaining (§4.2, §9).
//!
//! Connect to the jump host over a fresh TCP dial, open a `direct-tcpip` channel from
//! it to the target, wrap that channel as a plain stream (`Channel::into_stream`), and
//! run a second independent SSH handshake over it to reach the target. Only a single
//! jump hop is supported — the target is always the last leg.

use crate::config::{AuthMethod, ConnectRequest, EndpointConfig};
use crate::error::{Hop, TunnelError};

use super::client;
use super::keys;
use super::session::SshSession;

const HANDSHAKE_TIMEOUT_SECS: u64 = 15;
const JUMP_CHANNEL_OPEN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

/// Preflight an endpoint's key file, if it uses key auth. Must run before any TCP dial
/// for this hop — a rejected key (e.g. a `.pub` path) fails synchronously with nothing
/// else attempted (§7, scenario 6).
fn preflight_endpoint(endpoint: &EndpointConfig) -> Result<(), TunnelError> {
    match &endpoint.auth {
        AuthMethod::Key { key_path, .. } => keys::preflight_path(key_path),
        AuthMethod::Password { .. } => Ok(()),
    }
}

pub async fn connect(request: &ConnectRequest) -> Result<SshSession, TunnelError> {
    let policy = request.host_key_policy;

    // Validate every hop's key up front, before establishing any transport at all.
    preflight_endpoint(&request.target)?;
    if let Some(jump_cfg) = &request.jump {
        let jump_endpoint = jump_cfg.resolved(&request.target);
        preflight_endpoint(&jump_endpoint)?;
    }

    match &request.jump {
        None => {
            let handle = client::connect(&request.target, policy, Hop::Target, HANDSHAKE_TIMEOUT_SECS).await?;
            Ok(SshSession::new(handle, request.target.host.clone(), request.target.port, None))
        }
        Some(jump_cfg) => {
            let jump_endpoint = jump_cfg.resolved(&request.target);
            let jump_handle = client::connect(&jump_endpoint, policy, Hop::Jump, HANDSHAKE_TIMEOUT_SECS).await?;

            match connect_inner(request, &jump_handle, policy).await {
                Ok(target_handle) => Ok(SshSession::new(
                    target_handle,
                    request.target.host.clone(),
                    request.target.port,
                    Some((jump_handle, format!("{}:{} (jump)", jump_endpoint.host, jump_endpoint.port))),
                )),
                Err(e) => {
                    let _ = jump_handle.disconnect(russh::Disconnect::ByApplication, "jump setup failed", "en").await;
                    Err(e)
                }
            }
        }
    }
}

/// Open the `direct-tcpip` channel on the jump and authenticate the target over it.
/// Failures here are reported as *target*-mode errors even though the transport is
/// tunneled — only the outer TCP dial and handshake are attributed to the jump (§4.5).
async fn connect_inner(
    request: &ConnectRequest,
    jump_handle: &russh::client::Handle<client::ClientHandler>,
    policy: crate::config::HostKeyPolicy,
) -> Result<russh::client::Handle<client::ClientHandler>, TunnelError> {
    let channel = tokio::time::timeout(
        JUMP_CHANNEL_OPEN_TIMEOUT,
        jump_handle.channel_open_direct_tcpip(&request.target.host, request.target.port as u32, "127.0.0.1", 0),
    )
    .await
    .map_err(|_| TunnelError::Timeout {
        hop: Hop::Jump,
        reason: format!("opening channel to {}:{}", request.target.host, request.target.port),
    })?
    .map_err(|e| TunnelError::ChannelOpenFailed {
        host: request.target.host.clone(),
        port: request.target.port,
        reason: e.to_string(),
    })?;
    let stream = channel.into_stream();

    client::connect_via_stream(&request.target, stream, policy, Hop::Target, HANDSHAKE_TIMEOUT_SECS).await
}
