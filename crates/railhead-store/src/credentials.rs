//! SSH credentials and pinned host keys for talking to the remote.

use crate::StoreError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use git2::{CertificateCheckStatus, Cred, RemoteCallbacks};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct KnownHost {
    hosts: Vec<String>,
    key_type: String,
    fingerprint: [u8; 32],
}

/// Parsed `known_hosts` content, keyed by SHA-256 fingerprint of each host key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownHosts {
    entries: Vec<KnownHost>,
}

/// `[host]:port` and `host` both match `host`.
fn host_pattern_matches(pattern: &str, host: &str) -> bool {
    let bare = pattern
        .strip_prefix('[')
        .and_then(|p| p.split_once("]:"))
        .map_or(pattern, |(h, _)| h);
    bare.eq_ignore_ascii_case(host)
}

impl KnownHosts {
    pub fn parse(content: &str) -> Self {
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('@') || line.starts_with("|1|") {
                warn!("known_hosts line {}: markers and hashed hosts are not supported, skipping", lineno + 1);
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(hosts), Some(key_type), Some(key)) =
                (fields.next(), fields.next(), fields.next())
            else {
                warn!("known_hosts line {}: malformed entry, skipping", lineno + 1);
                continue;
            };
            let Ok(blob) = STANDARD.decode(key) else {
                warn!("known_hosts line {}: key is not valid base64, skipping", lineno + 1);
                continue;
            };
            let mut fingerprint = [0u8; 32];
            fingerprint.copy_from_slice(&Sha256::digest(&blob));
            entries.push(KnownHost {
                hosts: hosts.split(',').map(str::to_owned).collect(),
                key_type: key_type.to_owned(),
                fingerprint,
            });
        }
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accept only a key whose SHA-256 matches one pinned for `host`.
    pub fn verify(&self, host: &str, sha256: &[u8]) -> Result<(), StoreError> {
        let mut known = false;
        for entry in &self.entries {
            if entry.hosts.iter().any(|p| host_pattern_matches(p, host)) {
                known = true;
                if entry.fingerprint.as_slice() == sha256 {
                    debug!("host key for {host} matches pinned {} key", entry.key_type);
                    return Ok(());
                }
            }
        }
        if known {
            warn!("host key for {host} does not match any pinned key");
        } else {
            warn!("no pinned host key for {host}");
        }
        Err(StoreError::HostKey(host.to_owned()))
    }
}

/// Authentication material for fetch and push.
///
/// The private key is held in memory only. Without known hosts, SSH host
/// keys are rejected outright.
#[derive(Clone, Default)]
pub struct Credentials {
    username: Option<String>,
    private_key: Option<String>,
    known_hosts: KnownHosts,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("known_hosts", &self.known_hosts.len())
            .finish()
    }
}

impl Credentials {
    pub fn new(private_key: Option<String>, known_hosts: KnownHosts) -> Self {
        Self {
            username: None,
            private_key,
            known_hosts,
        }
    }

    pub fn load(key_path: Option<&Path>, known_hosts_path: Option<&Path>) -> Result<Self, StoreError> {
        let private_key = key_path
            .map(|p| {
                std::fs::read_to_string(p).map_err(|e| {
                    StoreError::Credentials(format!("reading ssh key {}: {e}", p.display()))
                })
            })
            .transpose()?;
        let known_hosts = match known_hosts_path {
            Some(p) => KnownHosts::load(p)?,
            None => KnownHosts::default(),
        };
        Ok(Self::new(private_key, known_hosts))
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn known_hosts(&self) -> &KnownHosts {
        &self.known_hosts
    }

    /// Callbacks wiring the key and host-key pinning into a git2 remote operation.
    pub fn remote_callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, _allowed| {
            let Some(key) = &self.private_key else {
                return Err(git2::Error::from_str("no ssh private key configured"));
            };
            let user = self
                .username
                .as_deref()
                .or(username_from_url)
                .unwrap_or("git");
            Cred::ssh_key_from_memory(user, None, key, None)
        });
        callbacks.certificate_check(move |cert, host| {
            let Some(hostkey) = cert.as_hostkey() else {
                return Ok(CertificateCheckStatus::CertificatePassthrough);
            };
            let Some(sha256) = hostkey.hash_sha256() else {
                return Err(git2::Error::from_str(
                    "remote did not provide a SHA-256 host key hash",
                ));
            };
            self.known_hosts
                .verify(host, sha256)
                .map(|()| CertificateCheckStatus::CertificateOk)
                .map_err(|e| git2::Error::from_str(&e.to_string()))
        });
        callbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
    const KEY_B: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIHbG6aZBRq8V6qXqM8xvDq2uL7eU8xWvWg0aN3s1c9dE";

    fn fingerprint(key: &str) -> Vec<u8> {
        Sha256::digest(STANDARD.decode(key).unwrap()).to_vec()
    }

    #[test]
    fn parse_skips_comments_and_hashed_hosts() {
        let content = format!(
            "# comment\n\ngithub.com,140.82.121.4 ssh-ed25519 {KEY_A}\n|1|abc=|def= ssh-ed25519 {KEY_B}\n@revoked bad ssh-ed25519 {KEY_B}\nbroken-line\n"
        );
        let hosts = KnownHosts::parse(&content);
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn verify_accepts_pinned_key() {
        let hosts = KnownHosts::parse(&format!("github.com ssh-ed25519 {KEY_A}"));
        hosts.verify("github.com", &fingerprint(KEY_A)).unwrap();
        hosts.verify("GitHub.com", &fingerprint(KEY_A)).unwrap();
    }

    #[test]
    fn verify_rejects_mismatch_and_unknown_host() {
        let hosts = KnownHosts::parse(&format!("github.com ssh-ed25519 {KEY_A}"));
        assert!(matches!(
            hosts.verify("github.com", &fingerprint(KEY_B)),
            Err(StoreError::HostKey(_))
        ));
        assert!(hosts.verify("gitlab.com", &fingerprint(KEY_A)).is_err());
    }

    #[test]
    fn verify_matches_bracketed_port_entries() {
        let hosts = KnownHosts::parse(&format!("[git.internal]:2222 ssh-ed25519 {KEY_B}"));
        hosts.verify("git.internal", &fingerprint(KEY_B)).unwrap();
    }

    #[test]
    fn empty_known_hosts_fails_closed() {
        let hosts = KnownHosts::default();
        assert!(hosts.verify("github.com", &fingerprint(KEY_A)).is_err());
    }

    #[test]
    fn debug_redacts_private_key() {
        let creds = Credentials::new(Some("-----BEGIN KEY-----".to_owned()), KnownHosts::default());
        let printed = format!("{creds:?}");
        assert!(!printed.contains("BEGIN"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn load_reads_key_and_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        let known = dir.path().join("known_hosts");
        std::fs::write(&key, "KEY").unwrap();
        std::fs::write(&known, format!("github.com ssh-ed25519 {KEY_A}\n")).unwrap();
        let creds = Credentials::load(Some(&key), Some(&known)).unwrap();
        assert_eq!(creds.known_hosts().len(), 1);
        assert!(Credentials::load(Some(&dir.path().join("missing")), None).is_err());
    }
}
