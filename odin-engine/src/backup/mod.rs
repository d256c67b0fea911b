//! Backup creation and lookup.
//!
//! A backup is one self-contained JSON record: the state file as it was, an
//! optional VCS patch, a compressed archive of the included files, and their
//! per-file hashes. Only the final write of the record is all-or-nothing;
//! patch and archive capture degrade to warnings inside the record.

pub mod archive;
pub mod record;
pub mod scope;

pub use record::{BackupRecord, BackupSummary};
pub use scope::BackupScope;

use crate::audit::{AuditTrail, Severity};
use crate::config::OdinConfig;
use crate::daemon::lock::{self, LockGuard};
use crate::fs::inclusion::InclusionPolicy;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::integrity::{combined_hash, ContentHasher, SnapshotIndex};
use crate::layout::Layout;
use crate::state::{CheckpointKind, CheckpointStore, StateFile};
use crate::utils::errors::{BackupError, IntegrityError};
use crate::utils::fsutil::atomic_write_with;
use crate::utils::ids;
use crate::vcs::Vcs;
use record::{GitInfo, RecordMetadata, WorkingTreeSnapshot};
use serde_json::json;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ACTOR: &str = "odin";

pub struct BackupManager {
    layout: Layout,
    policy: InclusionPolicy,
    compression_level: i32,
    /// Semantic hashes over the included (archived) files
    archive_index: SnapshotIndex,
    /// Semantic hashes over the whole tree, minus ignored directories
    tree_index: SnapshotIndex,
    /// Raw-byte hashes over the same files as `tree_index`
    raw_index: SnapshotIndex,
    checkpoints: CheckpointStore,
    vcs: Arc<dyn Vcs>,
    audit: AuditTrail,
    host: String,
    /// Final step of publishing a record
    publish: fn(&Path, &Path) -> io::Result<()>,
}

/// What a backup is for
struct BackupRequest<'a> {
    reason: &'a str,
    kind: CheckpointKind,
    rollback_target: Option<&'a str>,
}

impl BackupManager {
    pub fn new(layout: Layout, config: &OdinConfig, vcs: Arc<dyn Vcs>) -> Self {
        let threads = config.integrity.hash_threads;
        let policy = InclusionPolicy::from_config(&config.integrity, &config.archive);
        let tree_options = WalkOptions::ignoring(config.integrity.ignore_names.clone());

        let archive_index = SnapshotIndex::new(ContentHasher::semantic(), WalkOptions::with_policy(policy.clone()))
            .with_threads(threads);
        let tree_index = SnapshotIndex::new(ContentHasher::semantic(), tree_options.clone()).with_threads(threads);
        let raw_index = SnapshotIndex::new(ContentHasher::raw(), tree_options).with_threads(threads);

        let checkpoints = CheckpointStore::new(layout.checkpoints_dir(), layout.root(), tree_index.clone());
        let audit = AuditTrail::new(layout.audit_dir());

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            layout,
            policy,
            compression_level: config.archive.compression_level,
            archive_index,
            tree_index,
            raw_index,
            checkpoints,
            vcs,
            audit,
            host,
            publish: |from, to| fs::rename(from, to),
        }
    }

    /// Replace the rename that publishes records.
    #[cfg(test)]
    pub(crate) fn with_publish(mut self, publish: fn(&Path, &Path) -> io::Result<()>) -> Self {
        self.publish = publish;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn policy(&self) -> &InclusionPolicy {
        &self.policy
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn archive_index(&self) -> &SnapshotIndex {
        &self.archive_index
    }

    pub fn tree_index(&self) -> &SnapshotIndex {
        &self.tree_index
    }

    pub fn vcs(&self) -> &dyn Vcs {
        self.vcs.as_ref()
    }

    /// Create a backup on behalf of an automated caller.
    pub fn create_backup(&self, lock: &LockGuard, reason: &str) -> Result<BackupRecord, BackupError> {
        self.create_backup_as(lock, reason, CheckpointKind::Auto)
    }

    /// Create a backup and tag its checkpoint with `kind`.
    pub fn create_backup_as(
        &self,
        lock: &LockGuard,
        reason: &str,
        kind: CheckpointKind,
    ) -> Result<BackupRecord, BackupError> {
        self.check_lock(lock)?;
        self.create(BackupRequest {
            reason,
            kind,
            rollback_target: None,
        })
    }

    /// The safety backup taken before rolling back to `target_id`.
    pub(crate) fn create_safety_backup(
        &self,
        lock: &LockGuard,
        target_id: &str,
    ) -> Result<BackupRecord, BackupError> {
        self.check_lock(lock)?;
        self.create(BackupRequest {
            reason: &format!("pre_rollback_{target_id}"),
            kind: CheckpointKind::PreChange,
            rollback_target: Some(target_id),
        })
    }

    fn create(&self, request: BackupRequest<'_>) -> Result<BackupRecord, BackupError> {
        let root = self.layout.root();
        let created_at = ids::next_instant();
        let id = ids::format_id(created_at);
        let mut warnings = Vec::new();
        info!(backup_id = %id, reason = request.reason, "Creating backup");

        // 1. Prior state; a missing or broken file gives the default.
        let mut state = StateFile::load(&self.layout.state_file());
        let pre_change = state.to_value();

        // 2. VCS patch and commit, both optional.
        let git_available = self.vcs.is_available(root);
        let diff_patch = if git_available {
            let patch = self.vcs.diff(root);
            if patch.is_none() {
                warnings.push("vcs diff failed; no patch captured".to_string());
                warn!(backup_id = %id, "VCS diff failed, continuing without a patch");
            }
            patch.filter(|p| !p.trim().is_empty())
        } else {
            None
        };
        let git_info = GitInfo {
            has_changes: diff_patch.is_some(),
            diff_patch,
            commit_hash: if git_available { self.vcs.head_commit(root) } else { None },
        };

        // 3. Archive of the included files, optional.
        let working_tree_snapshot = match self.build_archive(root) {
            Ok(built) => {
                for path in &built.skipped {
                    warnings.push(format!("file left out of archive: {path}"));
                }
                WorkingTreeSnapshot {
                    available: true,
                    compressed_data: Some(built.encoded),
                    compression: Some(archive::COMPRESSION.to_string()),
                    inclusion: Some(self.policy.clone()),
                }
            }
            Err(e) => {
                warn!(backup_id = %id, "Archive failed: {}", e);
                warnings.push(format!("archive failed: {e}"));
                WorkingTreeSnapshot {
                    inclusion: Some(self.policy.clone()),
                    ..Default::default()
                }
            }
        };

        // 4. Hashes over the same predicate; mandatory.
        let sih_snapshot = self.archive_index.build(root)?;
        let project_hash = combined_hash(&sih_snapshot);

        let size_kb = working_tree_snapshot
            .compressed_data
            .as_ref()
            .map_or(0, |d| d.len() as u64 / 1024);

        let record = BackupRecord {
            backup_id: id.clone(),
            odin_version: env!("CARGO_PKG_VERSION").to_string(),
            backup_timestamp: created_at,
            reason: request.reason.to_string(),
            project_root: root.display().to_string(),
            git_available,
            pre_change_checkpoint: pre_change,
            project_integrity_hash: project_hash,
            git_info,
            working_tree_snapshot,
            metadata: RecordMetadata {
                files_count: sih_snapshot.len(),
                backup_size_estimate_kb: size_kb,
                creation_host: self.host.clone(),
                odin_session_id: state.extra_str("session_id").map(str::to_string),
            },
            sih_snapshot,
            rollback_target: request.rollback_target.map(str::to_string),
            warnings,
        };

        // 5. All-or-nothing write.
        self.persist_with(&record, self.publish)?;

        // 6. Point the state at the record, checkpoint it, audit it.
        state.backup_ref = Some(self.layout.backup_ref(&record.file_name()));
        state.touch(format!("backup_created_{}", request.reason));
        let file_hashes = match self.refresh_integrity(&mut state) {
            Ok(semantic) => semantic,
            Err(e) => {
                warn!(backup_id = %id, "Could not refresh state integrity: {}", e);
                Default::default()
            }
        };
        if let Err(e) = state.save(&self.layout.state_file()) {
            warn!(backup_id = %id, "Could not update state file: {}", e);
        }
        if let Err(e) = self.checkpoints.create_with_hashes(
            "backup",
            request.kind,
            state.to_value(),
            &format!("{} ({})", request.reason, id),
            file_hashes,
        ) {
            warn!(backup_id = %id, "Could not record checkpoint: {}", e);
        }

        let severity = if record.warnings.is_empty() {
            Severity::Info
        } else {
            Severity::Warning
        };
        self.audit.log_quietly(
            ACTOR,
            "backup_created",
            &id,
            json!({
                "reason": record.reason,
                "kind": request.kind,
                "files": record.metadata.files_count,
                "size_kb": record.metadata.backup_size_estimate_kb,
                "rollback_target": record.rollback_target,
                "warnings": record.warnings,
            }),
            severity,
        );

        info!(
            backup_id = %id,
            files = record.metadata.files_count,
            warnings = record.warnings.len(),
            "Backup created"
        );
        Ok(record)
    }

    fn build_archive(&self, root: &Path) -> io::Result<archive::BuiltArchive> {
        let files = walk_directory(root, &WalkOptions::with_policy(self.policy.clone()))?;
        archive::build(&files, self.compression_level)
    }

    /// Serialize and publish a record; `rename` performs the final step.
    /// Nothing appears under the record's name unless `rename` succeeds.
    pub(crate) fn persist_with<F>(&self, record: &BackupRecord, rename: F) -> Result<PathBuf, BackupError>
    where
        F: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        let dir = self.layout.backups_dir();
        fs::create_dir_all(&dir).map_err(|source| BackupError::RecordWrite {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(record.file_name());
        let data = serde_json::to_vec_pretty(record)?;
        atomic_write_with(&path, &data, rename).map_err(|source| BackupError::RecordWrite {
            path: path.clone(),
            source,
        })?;
        debug!("Backup record written to {}", path.display());
        Ok(path)
    }

    /// Store current whole-tree hashes, snapshot and context signature in
    /// `state`. Returns the semantic snapshot.
    pub(crate) fn refresh_integrity(
        &self,
        state: &mut StateFile,
    ) -> Result<crate::integrity::Snapshot, IntegrityError> {
        let root = self.layout.root();
        let semantic = self.tree_index.build(root)?;
        let raw = self.raw_index.build(root)?;
        state.record_integrity(root, &raw, &semantic);
        Ok(semantic)
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.layout.backups_dir().join(record::record_file_name(id))
    }

    pub fn load_record(&self, id: &str) -> Result<BackupRecord, BackupError> {
        if !record::is_valid_id(id) {
            return Err(BackupError::NotFound(id.to_string()));
        }
        record::read_record(&self.record_path(id), id)
    }

    pub fn show_backup(&self, id: &str) -> Result<BackupSummary, BackupError> {
        let record = self.load_record(id)?;
        Ok(record.summary(self.record_path(id)))
    }

    /// Record summaries, newest first. Unreadable records are skipped.
    pub fn list_backups(&self, limit: Option<usize>) -> Vec<BackupSummary> {
        let mut summaries: Vec<BackupSummary> = self
            .record_files()
            .into_iter()
            .filter_map(|(id, path)| match record::read_summary(&path, &id) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!("Skipping unreadable backup record {}: {}", path.display(), e);
                    None
                }
            })
            .collect();

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = limit {
            summaries.truncate(limit);
        }
        summaries
    }

    pub fn latest_backup(&self) -> Option<BackupSummary> {
        self.list_backups(Some(1)).into_iter().next()
    }

    /// `(id, path)` for every file named like a record.
    pub(crate) fn record_files(&self) -> Vec<(String, PathBuf)> {
        let read = match fs::read_dir(self.layout.backups_dir()) {
            Ok(read) => read,
            Err(_) => return Vec::new(),
        };
        read.filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let id = record::id_from_file_name(&name)?.to_string();
                Some((id, entry.path()))
            })
            .collect()
    }

    /// Fails unless `lock` is the instance lock of this manager's root.
    pub fn check_lock(&self, lock: &LockGuard) -> Result<(), BackupError> {
        if lock.lock_path() == lock::lock_path(self.layout.root()) {
            return Ok(());
        }
        Err(BackupError::ForeignLock {
            lock: lock.lock_path().to_path_buf(),
            root: self.layout.root().to_path_buf(),
        })
    }
}
