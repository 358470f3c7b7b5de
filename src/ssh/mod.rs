//! SSH transport layer: handshake, authentication, host-key verification, jump-host
//! chaining, and the single-owner channel controller that everything else is built on.

mod client;
pub mod handle_owner;
pub mod jump;
pub mod keys;
pub mod known_hosts;
mod session;

pub use client::ClientHandler;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use known_hosts::{get_known_hosts, HostKeyVerification, KnownHostsStore};
pub use session::SshSession;
