//! The caller-owned state document, `.odin/AI_CHECKPOINT.json`.
//!
//! The engine reads a handful of well-known fields and leaves everything else
//! untouched: unknown keys written by other tools survive a load/save cycle.

use crate::integrity::{combined_hash, sha256_hex, Snapshot};
use crate::utils::fsutil::atomic_write;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io;
use std::path::Path;
use tracing::warn;

pub const STATE_FILE_NAME: &str = "AI_CHECKPOINT.json";
pub const STATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Files whose content identifies what kind of project this is
const CONTEXT_MARKERS: &[&str] = &["requirements.txt", "pyproject.toml", "package.json", "Cargo.toml"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityHashes {
    pub binary_sha256: Option<String>,
    pub semantic_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub timestamp: Option<String>,

    #[serde(default = "default_current_state")]
    pub current_state: String,

    #[serde(default)]
    pub last_action: Option<String>,

    #[serde(default)]
    pub integrity: IntegrityHashes,

    #[serde(default)]
    pub backup_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sih_snapshot: Option<Snapshot>,

    #[serde(default)]
    pub context_sig: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version() -> String {
    STATE_VERSION.to_string()
}

fn default_current_state() -> String {
    "unknown".to_string()
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            timestamp: None,
            current_state: default_current_state(),
            last_action: None,
            integrity: IntegrityHashes::default(),
            backup_ref: None,
            sih_snapshot: None,
            context_sig: None,
            extra: Map::new(),
        }
    }
}

impl StateFile {
    /// Load the state file. A missing or unreadable file yields the default
    /// state; this never fails.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("Cannot read state file {}: {}, using defaults", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!("State file {} is corrupt: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        atomic_write(path, &data)
    }

    /// Rebuild a state from an embedded JSON blob (e.g. a backup record's
    /// `pre_change_checkpoint`). Anything that is not an object gives the
    /// default state.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Stamp the time and the action that produced this state
    pub fn touch(&mut self, action: impl Into<String>) {
        self.timestamp = Some(Utc::now().to_rfc3339());
        self.last_action = Some(action.into());
    }

    /// Store the hashes of the current tree.
    ///
    /// `raw` and `semantic` are snapshots of the same files built with the raw
    /// and the semantic hasher respectively.
    pub fn record_integrity(&mut self, root: &Path, raw: &Snapshot, semantic: &Snapshot) {
        self.integrity = IntegrityHashes {
            binary_sha256: Some(combined_hash(raw)),
            semantic_hash: Some(combined_hash(semantic)),
        };
        self.context_sig = Some(context_signature(root, semantic));
        self.sih_snapshot = Some(semantic.clone());
    }

    /// A string field stored outside the well-known keys
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// Fingerprint of the project context a state was captured in.
pub fn context_signature(root: &Path, snapshot: &Snapshot) -> String {
    let mut material = String::new();
    for (path, hash) in snapshot.iter() {
        material.push_str(path);
        material.push(':');
        material.push_str(hash);
        material.push('\n');
    }
    for marker in CONTEXT_MARKERS {
        if let Ok(content) = std::fs::read(root.join(marker)) {
            material.push_str(marker);
            material.push('\n');
            material.push_str(&String::from_utf8_lossy(&content));
        }
    }
    sha256_hex(material.as_bytes())
}
