//! Host key verification
//!
//! EC2 Linux images print their SSH host keys to the console between
//! `-----BEGIN SSH HOST KEY KEYS-----` and `-----END SSH HOST KEY KEYS-----`.
//! [`verify`] decides whether a presented key is acceptable under the
//! template's [`HostKeyVerification`] policy.

use crate::config::HostKeyVerification;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

const BEGIN_MARKER: &str = "-----BEGIN SSH HOST KEY KEYS-----";
const END_MARKER: &str = "-----END SSH HOST KEY KEYS-----";

/// An SSH public host key: algorithm name and base64 key blob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub algorithm: String,
    pub key: String,
}

impl HostKey {
    pub fn new(algorithm: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            key: key.into(),
        }
    }

    /// Parse an `authorized_keys` style line: `<algorithm> <base64> [comment]`
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let algorithm = parts.next()?;
        let key = parts.next()?;
        let known_algorithm = algorithm.starts_with("ssh-") || algorithm.starts_with("ecdsa-");
        (known_algorithm && !key.is_empty()).then(|| Self::new(algorithm, key))
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.algorithm, self.key)
    }
}

/// Host keys advertised in console output. Lines may carry an `ec2: ` prefix.
pub fn parse_console_host_keys(console: &str) -> Vec<HostKey> {
    let mut keys = Vec::new();
    let mut inside = false;
    for raw in console.lines() {
        let line = raw.trim();
        let line = line.strip_prefix("ec2:").map(str::trim).unwrap_or(line);
        if line == BEGIN_MARKER {
            inside = true;
        } else if line == END_MARKER {
            inside = false;
        } else if inside {
            match HostKey::parse_line(line) {
                Some(key) if !keys.contains(&key) => keys.push(key),
                _ => {}
            }
        }
    }
    keys
}

/// Result of checking a presented host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyDecision {
    /// Accept; `pin` asks the caller to remember the key
    Accept { pin: bool },
    Reject(String),
}

/// Check `presented` against the console keys and the pinned key.
pub fn verify(
    policy: HostKeyVerification,
    console: &[HostKey],
    pinned: Option<&HostKey>,
    presented: &HostKey,
) -> HostKeyDecision {
    use HostKeyDecision::{Accept, Reject};

    if policy == HostKeyVerification::Off {
        return Accept { pin: false };
    }

    if let Some(pinned) = pinned {
        return if pinned == presented {
            Accept { pin: false }
        } else {
            Reject(format!(
                "host key changed: pinned {}, presented {}",
                pinned.algorithm, presented.algorithm
            ))
        };
    }

    let advertised: Vec<&HostKey> = console
        .iter()
        .filter(|k| k.algorithm == presented.algorithm)
        .collect();

    match policy {
        HostKeyVerification::CheckNewHard if advertised.is_empty() => Reject(format!(
            "no {} host key in console output",
            presented.algorithm
        )),
        HostKeyVerification::CheckNewHard | HostKeyVerification::CheckNewSoft
            if !advertised.is_empty() =>
        {
            if advertised.contains(&presented) {
                Accept { pin: true }
            } else {
                Reject(format!(
                    "{} host key does not match console output",
                    presented.algorithm
                ))
            }
        }
        _ => Accept { pin: true },
    }
}

/// Host keys pinned per instance id
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    inner: Arc<Mutex<HashMap<String, HostKey>>>,
}

impl KnownHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance_id: &str) -> Option<HostKey> {
        self.lock().get(instance_id).cloned()
    }

    pub fn pin(&self, instance_id: &str, key: HostKey) {
        self.lock().insert(instance_id.to_string(), key);
    }

    /// Drop the pinned key of a terminated instance
    pub fn forget(&self, instance_id: &str) {
        self.lock().remove(instance_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HostKey>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
