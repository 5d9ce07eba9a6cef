//! Host key verification against a known_hosts file.
//!
//! The trust store is loaded once at startup. A missing or malformed file,
//! or no file location at all, is a [`FatalError::TrustStore`]. A key that does not match (or is absent
//! from) the store only fails that one host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys;
use tracing::{debug, warn};

use super::config::{KNOWN_HOSTS_ENV_VAR, RunSettings, STRICT_HOST_KEY_ENV_VAR};
use super::error::FatalError;

const DEFAULT_KNOWN_HOSTS_DISPLAY: &str = "~/.ssh/known_hosts";

/// How the client treats server host keys.
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Accept any key (like `StrictHostKeyChecking=no`).
    AcceptAll,
    /// Only accept keys recorded in the trust store.
    KnownHosts(Arc<TrustStore>),
}

impl HostKeyPolicy {
    /// Build the policy for a run, loading the trust store if verification
    /// is enabled.
    pub fn from_settings(settings: &RunSettings) -> Result<Self, FatalError> {
        if !settings.strict_host_key {
            warn!("Host key verification disabled");
            return Ok(Self::AcceptAll);
        }

        let Some(path) = &settings.known_hosts else {
            return Err(FatalError::TrustStore {
                path: PathBuf::from(DEFAULT_KNOWN_HOSTS_DISPLAY),
                reason: format!(
                    "no home directory to locate it, set {} or disable {}",
                    KNOWN_HOSTS_ENV_VAR, STRICT_HOST_KEY_ENV_VAR
                ),
            });
        };

        let store = TrustStore::load(path)?;
        if store.is_empty() {
            warn!(
                "{:?} has no entries, every host will fail verification",
                store.path()
            );
        } else {
            debug!(
                "Verifying host keys against {} entries in {:?}",
                store.len(),
                store.path()
            );
        }
        Ok(Self::KnownHosts(Arc::new(store)))
    }

    /// Check `key` presented by `host:port`.
    pub fn verify(&self, host: &str, port: u16, key: &keys::PublicKey) -> Result<(), String> {
        match self {
            Self::AcceptAll => Ok(()),
            Self::KnownHosts(store) => store.verify(host, port, key),
        }
    }
}

/// A known_hosts file that has been checked for readability and format.
#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    entries: usize,
}

impl TrustStore {
    pub fn load(path: &Path) -> Result<Self, FatalError> {
        let content = std::fs::read_to_string(path).map_err(|e| FatalError::TrustStore {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let entries = validate(&content).map_err(|reason| FatalError::TrustStore {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Look the key up in the store.
    pub fn verify(&self, host: &str, port: u16, key: &keys::PublicKey) -> Result<(), String> {
        match keys::check_known_hosts_path(host, port, key, &self.path) {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!(
                "host key verification failed: {}:{} is not in {:?}",
                host, port, self.path
            )),
            Err(e) => Err(format!(
                "host key verification failed for {}:{}: {}",
                host, port, e
            )),
        }
    }
}

/// Count entries, rejecting lines that cannot be known_hosts records.
///
/// A record is `[@marker] hosts keytype base64-key [comment]`. Blank lines
/// and `#` comments are skipped.
fn validate(content: &str) -> Result<usize, String> {
    let mut entries = 0;
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace().peekable();
        if fields.peek().is_some_and(|f| f.starts_with('@')) {
            fields.next();
        }
        if fields.count() < 3 {
            return Err(format!("line {} is not a known_hosts entry", index + 1));
        }
        entries += 1;
    }
    Ok(entries)
}
