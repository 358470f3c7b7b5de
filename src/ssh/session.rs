//! Live SSH session: a handle-owner controller for the target host, plus optionally one
//! for an intermediate jump host kept alive so its `direct-tcpip` channel keeps flowing.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::broadcast;
use tracing::debug;

use super::client::ClientHandler;
use super::handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
use crate::error::{Hop, TunnelError};

pub struct SshSession {
    pub host: String,
    pub port: u16,
    controller: HandleController,
    jump_controller: Option<HandleController>,
}

impl SshSession {
    /// Take ownership of the target handle (spawning its owner task) and, if this
    /// connection was made through a jump host, the jump handle as well.
    pub(super) fn new(
        handle: Handle<ClientHandler>,
        host: String,
        port: u16,
        jump: Option<(Handle<ClientHandler>, String)>,
    ) -> Self {
        let jump_controller = jump.map(|(jump_handle, label)| spawn_handle_owner_task(jump_handle, label));
        let controller = spawn_handle_owner_task(handle, format!("{host}:{port}"));
        Self { host, port, controller, jump_controller }
    }

    /// Open a `direct-tcpip` channel to `host:port`, used by the SOCKS5 listener for
    /// every proxied connection.
    pub async fn open_channel(&self, host: &str, port: u16, timeout: Duration) -> Result<Channel<Msg>, TunnelError> {
        tokio::time::timeout(timeout, self.controller.open_direct_tcpip(host, port as u32, "127.0.0.1", 0))
            .await
            .map_err(|_| TunnelError::Timeout { hop: Hop::Target, reason: format!("opening channel to {host}:{port}") })?
    }

    /// Liveness probe used by `TunnelManager`'s monitor loop: the target transport and,
    /// when this session was reached through a jump host, the jump transport as well.
    /// A timeout is treated as transient (still active); only a hard I/O failure on
    /// either leg reports inactive.
    pub async fn is_active(&self) -> bool {
        if matches!(self.controller.ping().await, PingResult::IoError) {
            return false;
        }
        if let Some(jump) = &self.jump_controller {
            if matches!(jump.ping().await, PingResult::IoError) {
                return false;
            }
        }
        true
    }

    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }

    /// Idempotent teardown: disconnect the target, then the jump hop behind it, if any.
    pub async fn close(&self) {
        debug!("closing ssh session to {}:{}", self.host, self.port);
        self.controller.disconnect().await;
        if let Some(jump) = &self.jump_controller {
            jump.disconnect().await;
        }
    }
}
