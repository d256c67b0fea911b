//! Backup record file format.
//!
//! One JSON document per backup, `backup_<id>.bak.json`. Records are written
//! once and never modified.

use crate::fs::inclusion::InclusionPolicy;
use crate::integrity::Snapshot;
use crate::utils::errors::BackupError;
use crate::utils::ids;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const RECORD_PREFIX: &str = "backup_";
pub const RECORD_SUFFIX: &str = ".bak.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInfo {
    pub has_changes: bool,
    pub diff_patch: Option<String>,
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingTreeSnapshot {
    pub available: bool,
    pub compressed_data: Option<String>,
    pub compression: Option<String>,
    /// Predicate that selected the archived files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inclusion: Option<InclusionPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub files_count: usize,
    pub backup_size_estimate_kb: u64,
    pub creation_host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odin_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub odin_version: String,
    pub backup_timestamp: DateTime<Utc>,
    pub reason: String,
    pub project_root: String,
    #[serde(default)]
    pub git_available: bool,

    /// Caller-owned state as it was before this backup
    #[serde(default)]
    pub pre_change_checkpoint: Value,

    /// Combined hash over `sih_snapshot`
    pub project_integrity_hash: String,

    #[serde(default)]
    pub git_info: GitInfo,

    #[serde(default)]
    pub working_tree_snapshot: WorkingTreeSnapshot,

    /// Per-file hashes of the archived file set
    #[serde(default)]
    pub sih_snapshot: Snapshot,

    /// Set on the safety record a rollback creates: the id being rolled back to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_target: Option<String>,

    /// Steps that degraded while building the record
    #[serde(default)]
    pub warnings: Vec<String>,

    #[serde(default)]
    pub metadata: RecordMetadata,
}

impl BackupRecord {
    pub fn file_name(&self) -> String {
        record_file_name(&self.backup_id)
    }

    pub fn is_safety_record(&self) -> bool {
        self.rollback_target.is_some()
    }

    pub fn tracked_file_count(&self) -> usize {
        self.sih_snapshot.len()
    }

    pub fn summary(&self, path: PathBuf) -> BackupSummary {
        BackupSummary {
            id: self.backup_id.clone(),
            created_at: self.backup_timestamp,
            reason: self.reason.clone(),
            project_hash: self.project_integrity_hash.clone(),
            files_count: self.metadata.files_count,
            size_kb: self.metadata.backup_size_estimate_kb,
            has_archive: self.working_tree_snapshot.available,
            has_patch: self.git_info.has_changes,
            commit_hash: self.git_info.commit_hash.clone(),
            rollback_target: self.rollback_target.clone(),
            warnings: self.warnings.len(),
            path,
        }
    }
}

/// The cheap view of a record used for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub project_hash: String,
    pub files_count: usize,
    pub size_kb: u64,
    pub has_archive: bool,
    pub has_patch: bool,
    pub commit_hash: Option<String>,
    pub rollback_target: Option<String>,
    pub warnings: usize,
    pub path: PathBuf,
}

impl BackupSummary {
    pub fn is_safety_record(&self) -> bool {
        self.rollback_target.is_some()
    }
}

/// Fields read when listing. The archive payload, patch and snapshot are
/// skipped over by the parser rather than materialized.
#[derive(Deserialize)]
struct SummaryFields {
    #[serde(default)]
    backup_id: Option<String>,
    backup_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    project_integrity_hash: String,
    #[serde(default)]
    git_info: GitSummary,
    #[serde(default)]
    working_tree_snapshot: ArchiveSummary,
    #[serde(default)]
    rollback_target: Option<String>,
    #[serde(default)]
    warnings: Vec<serde::de::IgnoredAny>,
    #[serde(default)]
    metadata: RecordMetadata,
}

#[derive(Deserialize, Default)]
struct GitSummary {
    #[serde(default)]
    has_changes: bool,
    #[serde(default)]
    commit_hash: Option<String>,
}

#[derive(Deserialize, Default)]
struct ArchiveSummary {
    #[serde(default)]
    available: bool,
}

pub fn record_file_name(id: &str) -> String {
    format!("{RECORD_PREFIX}{id}{RECORD_SUFFIX}")
}

/// Id encoded in a record file name, if it is one.
pub fn id_from_file_name(name: &str) -> Option<&str> {
    name.strip_prefix(RECORD_PREFIX)?
        .strip_suffix(RECORD_SUFFIX)
        .filter(|id| is_valid_id(id))
}

/// Ids are timestamp-like: ASCII alphanumerics, `_` and `-` only.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn read_record(path: &Path, id: &str) -> Result<BackupRecord, BackupError> {
    let raw = fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => BackupError::NotFound(id.to_string()),
        _ => BackupError::Io(e),
    })?;
    serde_json::from_slice(&raw).map_err(|e| BackupError::Corrupt {
        id: id.to_string(),
        message: e.to_string(),
    })
}

pub fn read_summary(path: &Path, id: &str) -> Result<BackupSummary, BackupError> {
    let raw = fs::read(path)?;
    let fields: SummaryFields = serde_json::from_slice(&raw).map_err(|e| BackupError::Corrupt {
        id: id.to_string(),
        message: e.to_string(),
    })?;

    let created_at = fields
        .backup_timestamp
        .or_else(|| ids::parse_id(id))
        .unwrap_or_default();

    Ok(BackupSummary {
        id: fields.backup_id.unwrap_or_else(|| id.to_string()),
        created_at,
        reason: fields.reason,
        project_hash: fields.project_integrity_hash,
        files_count: fields.metadata.files_count,
        size_kb: fields.metadata.backup_size_estimate_kb,
        has_archive: fields.working_tree_snapshot.available,
        has_patch: fields.git_info.has_changes,
        commit_hash: fields.git_info.commit_hash,
        rollback_target: fields.rollback_target,
        warnings: fields.warnings.len(),
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_round_trip() {
        let name = record_file_name("20240102_030405_000001");
        assert_eq!(name, "backup_20240102_030405_000001.bak.json");
        assert_eq!(id_from_file_name(&name), Some("20240102_030405_000001"));
        assert_eq!(id_from_file_name("backup_x.json"), None);
        assert_eq!(id_from_file_name("backup_../x.bak.json"), None);
        assert_eq!(id_from_file_name("notes.bak.json"), None);
    }

    #[test]
    fn test_summary_tolerates_minimal_record() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join(record_file_name("20240102_030405"));
        std::fs::write(
            &path,
            r#"{"reason": "legacy", "project_integrity_hash": "abc",
                "working_tree_snapshot": {"available": true, "compressed_data": "AAAA", "compression": "gzip+base64"},
                "metadata": {"files_count": 3, "backup_size_estimate_kb": 1, "creation_host": "h"}}"#,
        )
        .unwrap();

        let summary = read_summary(&path, "20240102_030405").unwrap();
        assert_eq!(summary.id, "20240102_030405");
        assert_eq!(summary.reason, "legacy");
        assert!(summary.has_archive);
        assert_eq!(summary.files_count, 3);
        assert_eq!(summary.created_at, ids::parse_id("20240102_030405").unwrap());
    }

    #[test]
    fn test_missing_record_is_not_found() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let result = read_record(&temp_dir.path().join("nope"), "nope");
        assert!(matches!(result, Err(BackupError::NotFound(_))));
    }
}
