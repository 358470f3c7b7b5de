//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Every other component talks to it
//! through a cloneable `HandleController`, which sends commands over an mpsc channel and
//! awaits a oneshot reply. This avoids `Arc<Mutex<Handle>>` contention and the deadlocks
//! that come from holding a lock across an `.await`.
//!
//! Trimmed to exactly the commands a tunneling-only client needs: opening a
//! `direct-tcpip` channel (used by both the SOCKS5 listener and jump-host chaining),
//! a keepalive ping, and disconnect. No session channels (PTY/shell) or remote
//! port forwarding — out of scope.

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use crate::error::TunnelError;

/// Ping outcome, distinguishing a transient timeout from a hard disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    Timeout,
    IoError,
}

pub enum HandleCommand {
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },
    Disconnect,
}

/// Handle to the owner task. Cloning it grants full control over the SSH connection
/// (open channels, disconnect), so it must never cross a trust boundary — every holder
/// is in-process Rust code in this crate.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Subscribe to disconnect notifications — fires once when the owner task exits.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TunnelError::Disconnected)?
            .map_err(|e| TunnelError::ChannelOpenFailed {
                host: host.to_string(),
                port: port as u16,
                reason: e.to_string(),
            })
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the owner task, taking ownership of `handle`, and return a controller for it.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, session_label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;
        info!("handle owner task started for {}", session_label);

        loop {
            match cmd_rx.recv().await {
                Some(HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("caller dropped before receiving direct-tcpip result");
                    }
                }
                Some(HandleCommand::Ping { reply_tx }) => {
                    debug!("keepalive probe for {}", session_label);
                    let result = match tokio::time::timeout(
                        std::time::Duration::from_secs(5),
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(e)) => {
                            let debug_repr = format!("{:?}", e);
                            if debug_repr.contains("Disconnect") || debug_repr.contains("disconnect") {
                                warn!("keepalive error for {}: {:?}", session_label, e);
                                PingResult::IoError
                            } else {
                                warn!("keepalive soft error for {}, treating as soft failure: {:?}", session_label, e);
                                PingResult::Timeout
                            }
                        }
                        Err(_) => {
                            warn!("keepalive timeout for {} (5s)", session_label);
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }
                Some(HandleCommand::Disconnect) => {
                    info!("disconnect requested for {}", session_label);
                    break;
                }
                None => {
                    info!("all controllers dropped for {}", session_label);
                    break;
                }
            }
        }

        let _ = disconnect_tx_clone.send(());
        drain_pending_commands(&mut cmd_rx);
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "tunnel closed", "en")
            .await;
        info!("handle owner task terminated for {}", session_label);
    });

    HandleController { cmd_tx, disconnect_tx }
}

fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
