//! A local secure-tunneling proxy: an SSH client (with optional jump-host chaining)
//! fronted by a local SOCKS5 proxy and a local HTTP/HTTPS forward proxy that dials its
//! upstream through that SOCKS5 service.

pub mod config;
pub mod error;
pub mod http_proxy;
pub mod manager;
pub mod relay;
pub mod socks5;
pub mod ssh;
pub mod stats;

pub use config::{AuthMethod, ConnectRequest, EndpointConfig, HostKeyPolicy, JumpConfig, LocalPorts};
pub use error::{AuthKind, Hop, TunnelError};
pub use manager::{Status, TunnelManager};
pub use stats::StatsSnapshot;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging. Intended to be called once by the embedding
/// binary or test harness, never by library code on its own.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
