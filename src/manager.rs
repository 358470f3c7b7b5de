//! `TunnelManager`: the supervisory state machine tying SSH, SOCKS5, and the HTTP proxy
//! together (§4.6). Startup is strictly SSH → SOCKS5 → HTTP; teardown is the reverse.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::ConnectRequest;
use crate::error::TunnelError;
use crate::http_proxy::HttpProxyListener;
use crate::socks5::Socks5Listener;
use crate::ssh::{jump, SshSession};
use crate::stats::{Stats, StatsSnapshot};

const MONITOR_POLL: Duration = Duration::from_secs(10);
const TEARDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Status kinds reported to `on_status_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Connected,
    Disconnected,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Disconnected => "disconnected",
        }
    }
}

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

type StatusSink = Box<dyn Fn(Status, Option<String>) + Send + Sync>;
type LogSink = Box<dyn Fn(&str) + Send + Sync>;

struct ActiveTunnel {
    session: Arc<SshSession>,
    socks: Socks5Listener,
    http: HttpProxyListener,
    shutdown_tx: broadcast::Sender<()>,
    monitor: tokio::task::JoinHandle<()>,
}

/// Owns the lifecycle of at most one active tunnel at a time. `connect`/`disconnect`
/// are serialized by an internal lock; calling `connect` while already Connecting or
/// Connected first forces a `disconnect`.
pub struct TunnelManager {
    state: AtomicU8,
    active: RwLock<Option<ActiveTunnel>>,
    stats: Arc<Stats>,
    on_status_changed: RwLock<Option<StatusSink>>,
    on_log: RwLock<Option<LogSink>>,
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_DISCONNECTED),
            active: RwLock::new(None),
            stats: Stats::new(),
            on_status_changed: RwLock::new(None),
            on_log: RwLock::new(None),
        }
    }

    pub fn on_status_changed(&self, sink: impl Fn(Status, Option<String>) + Send + Sync + 'static) {
        *self.on_status_changed.write() = Some(Box::new(sink));
    }

    pub fn on_log(&self, sink: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_log.write() = Some(Box::new(sink));
    }

    fn emit_status(&self, status: Status, detail: Option<String>) {
        if let Some(sink) = self.on_status_changed.read().as_ref() {
            sink(status, detail);
        }
    }

    fn log(&self, message: &str) {
        info!("{}", message);
        if let Some(sink) = self.on_log.read().as_ref() {
            sink(message);
        }
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }

    /// Connect SSH, then the SOCKS5 listener, then the HTTP proxy listener, in that
    /// order. Any setup failure tears down whatever already came up and the manager
    /// returns to Disconnected.
    pub async fn connect(&self, request: ConnectRequest) -> Result<(), TunnelError> {
        if self.state.load(Ordering::SeqCst) != STATE_DISCONNECTED {
            self.disconnect().await;
        }

        self.state.store(STATE_CONNECTING, Ordering::SeqCst);
        self.emit_status(Status::Connecting, None);

        match self.connect_inner(request).await {
            Ok(tunnel) => {
                *self.active.write() = Some(tunnel);
                self.state.store(STATE_CONNECTED, Ordering::SeqCst);
                self.emit_status(Status::Connected, None);
                self.log("tunnel connected");
                Ok(())
            }
            Err(e) => {
                self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                self.emit_status(Status::Disconnected, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn connect_inner(&self, request: ConnectRequest) -> Result<ActiveTunnel, TunnelError> {
        let session = Arc::new(jump::connect(&request).await?);
        self.log(&format!("ssh session established to {}:{}", session.host, session.port));

        let (shutdown_tx, _) = broadcast::channel(4);

        let socks = match Socks5Listener::bind(
            request.local.socks_port,
            session.clone(),
            self.stats.clone(),
            shutdown_tx.subscribe(),
        )
        .await
        {
            Ok(l) => l,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
        self.log(&format!("socks5 proxy listening on {}", socks.local_addr()));

        let http = match HttpProxyListener::bind(
            request.local.http_port,
            socks.local_addr().port(),
            shutdown_tx.subscribe(),
        )
        .await
        {
            Ok(l) => l,
            Err(e) => {
                socks.stop();
                session.close().await;
                return Err(e);
            }
        };
        self.log(&format!("http proxy listening on {}", http.local_addr()));

        let monitor = self.spawn_monitor(session.clone(), shutdown_tx.clone());

        Ok(ActiveTunnel { session, socks, http, shutdown_tx, monitor })
    }

    fn spawn_monitor(&self, session: Arc<SshSession>, shutdown_tx: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(MONITOR_POLL) => {
                        if !session.is_active().await {
                            warn!("transport to {}:{} reported inactive, tearing down", session.host, session.port);
                            let _ = shutdown_tx.send(());
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Tear down HTTP proxy, SOCKS5, SSH (and jump SSH), in that order. A no-op if
    /// already Disconnected.
    pub async fn disconnect(&self) {
        let tunnel = self.active.write().take();
        let Some(tunnel) = tunnel else {
            return;
        };

        let _ = tunnel.shutdown_tx.send(());
        tunnel.http.stop();
        tunnel.socks.stop();
        tunnel.session.close().await;

        if tokio::time::timeout(TEARDOWN_JOIN_TIMEOUT, tunnel.monitor).await.is_err() {
            warn!("monitor task did not join within {:?}", TEARDOWN_JOIN_TIMEOUT);
        }

        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
        self.emit_status(Status::Disconnected, None);
        self.log("tunnel disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_manager_starts_disconnected_with_zeroed_stats() {
        let manager = TunnelManager::new();
        assert!(!manager.is_connected());
        let stats = manager.get_stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.bytes_up, 0);
        assert_eq!(stats.bytes_down, 0);
    }

    #[tokio::test]
    async fn disconnect_without_a_connection_is_a_no_op() {
        let manager = TunnelManager::new();
        manager.disconnect().await;
        manager.disconnect().await;
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn disconnect_on_an_already_disconnected_manager_emits_no_status() {
        // disconnect() is a no-op when nothing is active (§8): it must not fire a
        // redundant Disconnected event every time it's called.
        let manager = TunnelManager::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        manager.on_status_changed(move |status, _detail| {
            seen_clone.lock().push(status);
        });

        manager.disconnect().await;

        assert!(seen.lock().is_empty());
    }
}
