//! Error taxonomy for the tunneling engine.

use std::path::PathBuf;

/// Which SSH hop an error pertains to — the final target, or an intermediate jump host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    Target,
    Jump,
}

impl std::fmt::Display for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Hop::Target => write!(f, "target"),
            Hop::Jump => write!(f, "jump"),
        }
    }
}

/// Which authentication mode an error pertains to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Password,
    Key,
}

impl std::fmt::Display for AuthKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthKind::Password => write!(f, "password"),
            AuthKind::Key => write!(f, "key"),
        }
    }
}

/// Why a private key file was rejected during preflight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRejectReason {
    /// File has a `.pub` suffix — looks like a public key.
    PublicKeySuffix,
    /// File contents look like a PuTTY `.ppk` private key.
    PuttyFormat,
    /// File contents look like a public-key text blob (`ssh-...` / `ecdsa-...`).
    PublicKeyText,
    /// File could not be read at all.
    Unreadable(String),
}

impl std::fmt::Display for KeyRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyRejectReason::PublicKeySuffix => write!(f, "path has a .pub suffix (public key)"),
            KeyRejectReason::PuttyFormat => write!(f, "PuTTY .ppk format is not supported"),
            KeyRejectReason::PublicKeyText => write!(f, "file content looks like a public key"),
            KeyRejectReason::Unreadable(e) => write!(f, "could not read key file: {e}"),
        }
    }
}

/// The crate's error currency. Setup errors (from `connect`) carry hop/mode context per
/// the error handling taxonomy; per-connection errors never reach this type, they are
/// logged and swallowed where they occur.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("{hop} configuration error: {reason}")]
    Configuration { hop: Hop, reason: String },

    #[error("key preflight rejected {path}: {reason}")]
    KeyPreflightRejected { path: PathBuf, reason: KeyRejectReason },

    #[error("key requires passphrase: {path}")]
    KeyPassphraseRequired { path: PathBuf },

    #[error("key unparseable or passphrase wrong: {path}")]
    KeyUnparseable { path: PathBuf },

    #[error("{hop} authentication failed ({mode}): {reason}")]
    AuthenticationFailed { hop: Hop, mode: AuthKind, reason: String },

    #[error("{hop} connection failed: {reason}")]
    ConnectionFailed { hop: Hop, reason: String },

    #[error("{hop} connection timed out: {reason}")]
    Timeout { hop: Hop, reason: String },

    #[error("channel open to {host}:{port} failed: {reason}")]
    ChannelOpenFailed { host: String, port: u16, reason: String },

    #[error("listener bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("session already disconnected")]
    Disconnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] russh::Error),

    #[error(transparent)]
    Key(#[from] russh::keys::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
