//! Configuration types consumed by `TunnelManager::connect`.
//!
//! The crate performs no persistence or user-entry of its own — these types are built
//! by an external collaborator (CLI flags, a GUI form, a test fixture) and handed in
//! already populated.

use serde::{Deserialize, Serialize};

/// Authentication mode for a single SSH hop. Precisely two variants — the caller's
/// choice is explicit and is never inferred from which fields happen to be populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    Password { password: String },
    Key {
        key_path: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password { password: password.into() }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key { key_path: key_path.into(), passphrase }
    }

    pub fn kind(&self) -> crate::error::AuthKind {
        match self {
            AuthMethod::Password { .. } => crate::error::AuthKind::Password,
            AuthMethod::Key { .. } => crate::error::AuthKind::Key,
        }
    }
}

/// Host-key verification policy for `SshSession::open`.
///
/// `AutoAdd` is the spec-mandated minimum (trust on first use, always). `Verify` is an
/// opt-in hardening that additionally rejects a host whose key has changed since it was
/// first seen, consulting `~/.ssh/known_hosts`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum HostKeyPolicy {
    #[default]
    AutoAdd,
    Verify,
}

/// One SSH endpoint: the target host, or a jump host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

fn default_ssh_port() -> u16 {
    22
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self { host: host.into(), port, username: username.into(), auth }
    }
}

/// Jump-host (ProxyJump) configuration. Fields left empty fall back to the target's
/// corresponding value once, at connect time (§4.2) — except the auth mode itself,
/// which is never inherited and must always be explicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    pub auth: AuthMethod,
}

impl JumpConfig {
    /// Convenience constructor for a jump hop that carries its own username/auth
    /// explicitly, with no fallback to the target.
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self { host: host.into(), port, username: Some(username.into()), auth }
    }

    /// Convenience constructor for a jump hop that borrows username/password/key-path
    /// from the target entirely (only the host/port differ). The auth *mode* must
    /// still be spelled out explicitly — see the module-level fallback discipline.
    pub fn bare(host: impl Into<String>, port: u16, auth: AuthMethod) -> Self {
        Self { host: host.into(), port, username: None, auth }
    }

    /// Apply the jump-auth fallback rule: empty username/password/key-path fields
    /// borrow the target's values. This is a value-only fallback, evaluated once;
    /// it never changes which `AuthMethod` variant the jump uses.
    fn resolved_username(&self, target: &EndpointConfig) -> String {
        self.username.clone().filter(|u| !u.is_empty()).unwrap_or_else(|| target.username.clone())
    }

    /// Value-only fallback: an empty password/key-path borrows the target's value of
    /// the *same* auth kind. It never flips the jump's chosen mode (Password vs Key) —
    /// if the target used a different mode there is nothing to borrow and the jump's
    /// own (empty) value is kept as-is, surfacing as an authentication error later.
    fn resolved_auth(&self, target: &EndpointConfig) -> AuthMethod {
        match &self.auth {
            AuthMethod::Password { password } if password.is_empty() => {
                match &target.auth {
                    AuthMethod::Password { password: target_password } => {
                        AuthMethod::Password { password: target_password.clone() }
                    }
                    _ => self.auth.clone(),
                }
            }
            AuthMethod::Key { key_path, passphrase } if key_path.is_empty() => match &target.auth {
                AuthMethod::Key { key_path: target_key_path, passphrase: target_passphrase } => {
                    AuthMethod::Key {
                        key_path: target_key_path.clone(),
                        passphrase: passphrase.clone().or_else(|| target_passphrase.clone()),
                    }
                }
                _ => self.auth.clone(),
            },
            other => other.clone(),
        }
    }

    /// Resolve this jump's effective endpoint, applying the one-shot fallback against
    /// the target endpoint it is chained in front of.
    pub fn resolved(&self, target: &EndpointConfig) -> EndpointConfig {
        EndpointConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.resolved_username(target),
            auth: self.resolved_auth(target),
        }
    }
}

/// Local listener ports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LocalPorts {
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_socks_port() -> u16 {
    10800
}

fn default_http_port() -> u16 {
    10801
}

impl Default for LocalPorts {
    fn default() -> Self {
        Self { socks_port: default_socks_port(), http_port: default_http_port() }
    }
}

/// Immutable input to `TunnelManager::connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub target: EndpointConfig,
    #[serde(default)]
    pub jump: Option<JumpConfig>,
    #[serde(default)]
    pub local: LocalPorts,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// Whether the collaborator intends to also flip the OS proxy once connected.
    /// The core is agnostic to this — it is recorded only because it rides along on
    /// the same config record the external collaborator persists (§6).
    #[serde(default)]
    pub auto_set_system_proxy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(auth: AuthMethod) -> EndpointConfig {
        EndpointConfig { host: "target.example".into(), port: 22, username: "alice".into(), auth }
    }

    #[test]
    fn jump_with_empty_username_falls_back_to_target() {
        let jump = JumpConfig {
            host: "jump.example".into(),
            port: 22,
            username: None,
            auth: AuthMethod::password(""),
        };
        let t = target(AuthMethod::password("hunter2"));
        let resolved = jump.resolved(&t);
        assert_eq!(resolved.username, "alice");
    }

    #[test]
    fn jump_with_explicit_username_is_not_overridden() {
        let jump = JumpConfig {
            host: "jump.example".into(),
            port: 22,
            username: Some("bob".into()),
            auth: AuthMethod::password("secret"),
        };
        let t = target(AuthMethod::password("hunter2"));
        let resolved = jump.resolved(&t);
        assert_eq!(resolved.username, "bob");
        assert_eq!(resolved.port, 22);
    }

    #[test]
    fn jump_with_empty_password_falls_back_to_target_password() {
        let jump = JumpConfig {
            host: "jump.example".into(),
            port: 22,
            username: None,
            auth: AuthMethod::password(""),
        };
        let t = target(AuthMethod::password("hunter2"));
        let resolved = jump.resolved(&t);
        assert!(matches!(resolved.auth, AuthMethod::Password { password } if password == "hunter2"));
    }

    #[test]
    fn jump_auth_mode_is_never_inherited_from_target() {
        // Jump explicitly asked for key auth with an empty path; the target uses
        // password auth. There is nothing of the same kind to borrow, so the jump's
        // own (empty) key path is kept rather than silently flipping to password.
        let jump = JumpConfig {
            host: "jump.example".into(),
            port: 22,
            username: None,
            auth: AuthMethod::key("", None),
        };
        let t = target(AuthMethod::password("hunter2"));
        let resolved = jump.resolved(&t);
        assert!(matches!(resolved.auth, AuthMethod::Key { key_path, .. } if key_path.is_empty()));
    }

    #[test]
    fn jump_key_passphrase_falls_back_independently_of_path() {
        let jump = JumpConfig {
            host: "jump.example".into(),
            port: 22,
            username: None,
            auth: AuthMethod::key("", Some("jump-pass".into())),
        };
        let t = target(AuthMethod::key("/home/alice/.ssh/id_ed25519", Some("target-pass".into())));
        let resolved = jump.resolved(&t);
        match resolved.auth {
            AuthMethod::Key { key_path, passphrase } => {
                assert_eq!(key_path, "/home/alice/.ssh/id_ed25519");
                assert_eq!(passphrase.as_deref(), Some("jump-pass"));
            }
            _ => panic!("expected key auth"),
        }
    }

    #[test]
    fn local_ports_default_to_spec_values() {
        let ports = LocalPorts::default();
        assert_eq!(ports.socks_port, 10800);
        assert_eq!(ports.http_port, 10801);
    }
}
