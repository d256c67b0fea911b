//! Checkpoints: a saved state plus the project's file hashes at one instant.
//!
//! Layout: `.odin/checkpoints/<id>/checkpoint.json`. A directory without its
//! manifest is not a checkpoint; deletion removes the manifest first so a
//! half-deleted checkpoint never looks valid.

use crate::integrity::{diff, DriftReport, Snapshot, SnapshotIndex};
use crate::utils::errors::{OdinError, Result};
use crate::utils::fsutil::atomic_write;
use crate::utils::ids;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MANIFEST_NAME: &str = "checkpoint.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointKind {
    Auto,
    Manual,
    PreChange,
    Milestone,
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CheckpointKind::Auto => "AUTO",
            CheckpointKind::Manual => "MANUAL",
            CheckpointKind::PreChange => "PRE_CHANGE",
            CheckpointKind::Milestone => "MILESTONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,

    #[serde(rename = "task_id")]
    pub owner_context_id: String,

    #[serde(rename = "type")]
    pub kind: CheckpointKind,

    pub description: String,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub state_snapshot: Value,

    #[serde(default)]
    pub file_hashes: Snapshot,
}

/// Checkpoint directory store for one project root.
pub struct CheckpointStore {
    dir: PathBuf,
    root: PathBuf,
    index: SnapshotIndex,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, root: impl Into<PathBuf>, index: SnapshotIndex) -> Self {
        Self {
            dir: dir.into(),
            root: root.into(),
            index,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record the current file hashes together with `state_snapshot`.
    pub fn create(
        &self,
        owner_context_id: &str,
        kind: CheckpointKind,
        state_snapshot: Value,
        description: &str,
    ) -> Result<Checkpoint> {
        let file_hashes = self.index.build(&self.root)?;
        self.create_with_hashes(owner_context_id, kind, state_snapshot, description, file_hashes)
    }

    /// Same as [`create`](Self::create) with file hashes the caller already
    /// computed for the current tree.
    pub fn create_with_hashes(
        &self,
        owner_context_id: &str,
        kind: CheckpointKind,
        state_snapshot: Value,
        description: &str,
        file_hashes: Snapshot,
    ) -> Result<Checkpoint> {
        let created_at = ids::next_instant();
        let id = format!("{}_{}", sanitize(owner_context_id), ids::format_id(created_at));

        let checkpoint = Checkpoint {
            id,
            owner_context_id: owner_context_id.to_string(),
            kind,
            description: description.to_string(),
            created_at,
            state_snapshot,
            file_hashes,
        };

        let checkpoint_dir = self.dir.join(&checkpoint.id);
        fs::create_dir_all(&checkpoint_dir)?;
        let data = serde_json::to_vec_pretty(&checkpoint)?;
        atomic_write(&checkpoint_dir.join(MANIFEST_NAME), &data)?;

        info!(
            checkpoint_id = %checkpoint.id,
            kind = %kind,
            files = checkpoint.file_hashes.len(),
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Checkpoints newest first, optionally only those of one owner.
    pub fn list(&self, owner: Option<&str>, limit: Option<usize>) -> Vec<Checkpoint> {
        let mut checkpoints: Vec<Checkpoint> = self
            .manifest_dirs()
            .into_iter()
            .filter_map(|dir| read_manifest(&dir))
            .filter(|cp| owner.map_or(true, |o| cp.owner_context_id == o))
            .collect();

        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = limit {
            checkpoints.truncate(limit);
        }
        checkpoints
    }

    pub fn get(&self, id: &str) -> Result<Checkpoint> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(OdinError::CheckpointNotFound(id.to_string()));
        }
        read_manifest(&self.dir.join(id)).ok_or_else(|| OdinError::CheckpointNotFound(id.to_string()))
    }

    /// Drift from the checkpoint's file hashes to the current tree.
    pub fn compare(&self, id: &str) -> Result<DriftReport> {
        let checkpoint = self.get(id)?;
        let current = self.index.build(&self.root)?;
        Ok(diff(&checkpoint.file_hashes, &current))
    }

    /// Directories that contain a manifest, with the manifest's timestamp.
    pub(crate) fn entries(&self) -> Vec<(PathBuf, DateTime<Utc>)> {
        self.manifest_dirs()
            .into_iter()
            .filter_map(|dir| read_manifest(&dir).map(|cp| (dir, cp.created_at)))
            .collect()
    }

    fn manifest_dirs(&self) -> Vec<PathBuf> {
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(e) => {
                debug!("No checkpoints at {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };

        read.filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.join(MANIFEST_NAME).is_file())
            .collect()
    }
}

/// Delete one checkpoint directory: manifest first, then the rest.
pub(crate) fn remove_checkpoint_dir(dir: &Path) -> std::io::Result<()> {
    match fs::remove_file(dir.join(MANIFEST_NAME)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    fs::remove_dir_all(dir)
}

fn read_manifest(dir: &Path) -> Option<Checkpoint> {
    let path = dir.join(MANIFEST_NAME);
    let raw = fs::read(&path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(cp) => Some(cp),
        Err(e) => {
            warn!("Ignoring unreadable checkpoint manifest {}: {}", path.display(), e);
            None
        }
    }
}

fn sanitize(owner: &str) -> String {
    let cleaned: String = owner
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::ContentHasher;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> CheckpointStore {
        let root = temp_dir.path().join("project");
        fs::create_dir_all(&root).unwrap();
        let ignore: BTreeSet<String> = [".odin".to_string()].into_iter().collect();
        CheckpointStore::new(
            root.join(".odin/checkpoints"),
            &root,
            SnapshotIndex::ignoring(ContentHasher::semantic(), ignore),
        )
    }

    #[test]
    fn test_create_get_and_compare() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let root = temp_dir.path().join("project");
        fs::write(root.join("main.py"), "print(1)\n").unwrap();

        let cp = store
            .create("task 42", CheckpointKind::PreChange, serde_json::json!({"k": 1}), "before edit")
            .unwrap();
        assert!(cp.id.starts_with("task_42_"));
        assert_eq!(store.get(&cp.id).unwrap(), cp);
        assert!(!store.compare(&cp.id).unwrap().has_changes());

        fs::write(root.join("main.py"), "print(2)\n").unwrap();
        assert_eq!(store.compare(&cp.id).unwrap().modified, vec!["main.py"]);
    }

    #[test]
    fn test_list_newest_first_with_owner_filter() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let a = store.create("alpha", CheckpointKind::Auto, Value::Null, "1").unwrap();
        let b = store.create("beta", CheckpointKind::Manual, Value::Null, "2").unwrap();
        let c = store.create("alpha", CheckpointKind::Milestone, Value::Null, "3").unwrap();

        let ids: Vec<_> = store.list(None, None).into_iter().map(|cp| cp.id).collect();
        assert_eq!(ids, vec![c.id.clone(), b.id.clone(), a.id.clone()]);

        let alpha: Vec<_> = store.list(Some("alpha"), Some(1)).into_iter().map(|cp| cp.id).collect();
        assert_eq!(alpha, vec![c.id]);
    }

    #[test]
    fn test_directory_without_manifest_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let cp = store.create("t", CheckpointKind::Auto, Value::Null, "x").unwrap();

        fs::remove_file(store.dir().join(&cp.id).join(MANIFEST_NAME)).unwrap();
        assert!(store.list(None, None).is_empty());
        assert!(matches!(store.get(&cp.id), Err(OdinError::CheckpointNotFound(_))));
    }

    #[test]
    fn test_get_rejects_path_like_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        assert!(store.get("../x").is_err());
        assert!(store.get("").is_err());
    }

    #[test]
    fn test_kind_serializes_upper_snake() {
        assert_eq!(serde_json::to_string(&CheckpointKind::PreChange).unwrap(), "\"PRE_CHANGE\"");
        assert_eq!(CheckpointKind::Milestone.to_string(), "MILESTONE");
    }
}
