//! `~/.ssh/known_hosts` verification — opt-in hardening beyond the spec-mandated
//! auto-add TOFU policy (§10.5).

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::TunnelError;

#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    Verified,
    Unknown { fingerprint: String },
    Changed { expected_fingerprint: String, actual_fingerprint: String },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl Default for KnownHostsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KnownHostsStore {
    pub fn new() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts"));

        let store = Self { hosts: RwLock::new(HashMap::new()), path };
        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts: {}", e);
        }
        store
    }

    pub fn with_path(path: PathBuf) -> Self {
        let store = Self { hosts: RwLock::new(HashMap::new()), path };
        if let Err(e) = store.load() {
            debug!("known_hosts not found or empty: {}", e);
        }
        store
    }

    fn load(&self) -> Result<(), TunnelError> {
        if !self.path.exists() {
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry { key_type: parts[1].to_string(), key_data: parts[2].to_string() };

            for hostname in parts[0].split(',') {
                if hostname.starts_with('|') {
                    continue; // hashed hostnames unsupported
                }
                let normalized = Self::normalize_hostname(hostname);
                hosts.entry(normalized).or_default().push(entry.clone());
                entry_count += 1;
            }
        }

        info!("Loaded {} known host entries ({} unique hosts)", entry_count, hosts.len());
        Ok(())
    }

    fn normalize_hostname(host: &str) -> String {
        let host = host.trim_start_matches('[');
        if let Some(idx) = host.find("]:") {
            host[..idx].to_lowercase()
        } else {
            host.trim_end_matches(']').to_lowercase()
        }
    }

    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    pub fn fingerprint(key: &PublicKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.public_key_bytes());
        let hash = hasher.finalize();
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    fn compute_fingerprint_from_b64(stored_b64: &str) -> String {
        if let Ok(bytes) = BASE64.decode(stored_b64) {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            let hash = hasher.finalize();
            format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
        } else {
            "unknown".to_string()
        }
    }

    fn key_type_name(key: &PublicKey) -> &'static str {
        match key.algorithm().as_str() {
            "ssh-ed25519" => "ssh-ed25519",
            "ssh-rsa" => "ssh-rsa",
            "ecdsa-sha2-nistp256" => "ecdsa-sha2-nistp256",
            "ecdsa-sha2-nistp384" => "ecdsa-sha2-nistp384",
            "ecdsa-sha2-nistp521" => "ecdsa-sha2-nistp521",
            _ => "ssh-rsa",
        }
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = Self::key_type_name(key);
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();

        let check_entries = |entries: &Vec<HostKeyEntry>| -> Option<HostKeyVerification> {
            for entry in entries {
                if entry.key_type == actual_key_type {
                    return Some(if entry.key_data == actual_key_b64 {
                        HostKeyVerification::Verified
                    } else {
                        HostKeyVerification::Changed {
                            expected_fingerprint: Self::compute_fingerprint_from_b64(&entry.key_data),
                            actual_fingerprint: fingerprint.clone(),
                        }
                    });
                }
            }
            None
        };

        for key_variant in [lookup_key.as_str(), host.to_lowercase().as_str()] {
            if let Some(entries) = hosts.get(key_variant) {
                if let Some(result) = check_entries(entries) {
                    return result;
                }
                debug!("host {} known but no {} key stored, treating as new", key_variant, actual_key_type);
                return HostKeyVerification::Unknown { fingerprint };
            }
        }

        HostKeyVerification::Unknown { fingerprint }
    }

    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), TunnelError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = Self::key_type_name(key).to_string();

        {
            let mut hosts = self.hosts.write();
            hosts
                .entry(lookup_key.clone())
                .or_default()
                .push(HostKeyEntry { key_type: key_type.clone(), key_data: key_b64.clone() });
        }

        self.append_to_file(&lookup_key, &key_type, &key_b64)?;
        info!("Added host key for {} (type: {}) to known_hosts", lookup_key, key_type);
        Ok(())
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), TunnelError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{} {} {}", host, key_type, key_b64)?;
        Ok(())
    }
}

static KNOWN_HOSTS: std::sync::OnceLock<KnownHostsStore> = std::sync::OnceLock::new();

pub fn get_known_hosts() -> &'static KnownHostsStore {
    KNOWN_HOSTS.get_or_init(KnownHostsStore::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_hostname_strips_brackets_and_port() {
        assert_eq!(KnownHostsStore::normalize_hostname("github.com"), "github.com");
        assert_eq!(KnownHostsStore::normalize_hostname("[github.com]:22"), "github.com");
        assert_eq!(
            KnownHostsStore::normalize_hostname("[server.example.com]:2222"),
            "server.example.com"
        );
    }

    #[test]
    fn make_key_omits_default_port() {
        assert_eq!(KnownHostsStore::make_key("github.com", 22), "github.com");
        assert_eq!(KnownHostsStore::make_key("server.com", 2222), "[server.com]:2222");
    }

    #[test]
    fn unknown_host_reports_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHostsStore::with_path(dir.path().join("known_hosts"));
        let hosts = store.hosts.read();
        assert!(hosts.is_empty());
    }
}
