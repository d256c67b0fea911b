//! Restore a project to the state captured in a backup record.
//!
//! Order of operations for `rollback_to`:
//! 1. resolve the target record (`NotFound` stops here, nothing is touched)
//! 2. take a safety backup of the current tree; if that fails, stop
//! 3. reverse-apply the record's VCS patch when there is one
//! 4. extract the record's archive over the root
//! 5. with `mirror`, delete included files the record does not know
//! 6. refresh the state file and audit the outcome
//!
//! Once step 2 has succeeded every later failure is reported in the outcome
//! instead of being returned as an error.

use crate::audit::Severity;
use crate::backup::{archive, BackupManager, BackupRecord, ACTOR};
use crate::daemon::lock::LockGuard;
use crate::fs::inclusion::InclusionPolicy;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::integrity::{diff, DriftReport};
use crate::state::StateFile;
use crate::utils::errors::{BackupError, RollbackError};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::fs;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackOutcome {
    pub target_id: String,
    /// Backup taken right before the rollback; roll back to it to undo
    pub safety_record_id: String,
    pub restored_count: usize,
    pub deleted_count: usize,
    pub patch_reverted: bool,
    /// Per-file failures
    pub errors: Vec<String>,
    /// Degraded steps that did not affect individual files
    pub warnings: Vec<String>,
    /// Difference between the record's hashes and the tree after restore
    pub residual_drift: DriftReport,
}

impl RollbackOutcome {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// `PartialRestore` when any file failed, the outcome otherwise.
    pub fn into_result(self) -> Result<Self, RollbackError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RollbackError::PartialRestore {
                restored: self.restored_count,
                errors: self.errors,
                safety_record_id: self.safety_record_id,
            })
        }
    }
}

pub struct RollbackEngine<'a> {
    manager: &'a BackupManager,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(manager: &'a BackupManager) -> Self {
        Self { manager }
    }

    pub fn rollback_to(
        &self,
        lock: &LockGuard,
        record_id: &str,
        mirror: bool,
    ) -> Result<RollbackOutcome, RollbackError> {
        let target = self.manager.load_record(record_id).map_err(|e| match e {
            BackupError::NotFound(id) => RollbackError::NotFound(id),
            other => RollbackError::InvalidRecord {
                id: record_id.to_string(),
                message: other.to_string(),
            },
        })?;

        let safety = self
            .manager
            .create_safety_backup(lock, record_id)
            .map_err(RollbackError::SafetyCheckpointFailed)?;
        info!(
            target = record_id,
            safety_record = %safety.backup_id,
            mirror,
            "Rolling back"
        );

        let mut outcome = RollbackOutcome {
            target_id: record_id.to_string(),
            safety_record_id: safety.backup_id,
            ..Default::default()
        };

        self.revert_patch(&target, &mut outcome);
        self.restore_archive(&target, &mut outcome);
        if mirror {
            self.mirror_delete(&target, &mut outcome);
        }
        self.finish(&target, &mut outcome);

        Ok(outcome)
    }

    /// Roll back to the newest record that is not itself a rollback's
    /// safety record.
    pub fn rollback_last(&self, lock: &LockGuard, mirror: bool) -> Result<RollbackOutcome, RollbackError> {
        let target = self
            .manager
            .list_backups(None)
            .into_iter()
            .find(|summary| !summary.is_safety_record())
            .ok_or_else(|| RollbackError::NotFound("no backups available".to_string()))?;
        self.rollback_to(lock, &target.id, mirror)
    }

    fn revert_patch(&self, target: &BackupRecord, outcome: &mut RollbackOutcome) {
        let Some(patch) = target.git_info.diff_patch.as_deref() else {
            return;
        };
        let root = self.manager.layout().root();
        if !self.manager.vcs().is_available(root) {
            outcome
                .warnings
                .push("record has a patch but no version control is available".to_string());
            return;
        }

        match self.manager.vcs().apply_reverse(root, patch) {
            Ok(()) => outcome.patch_reverted = true,
            Err(e) => {
                warn!("Reverse patch failed: {}", e);
                outcome.warnings.push(format!("reverse patch failed: {e}"));
            }
        }
    }

    fn restore_archive(&self, target: &BackupRecord, outcome: &mut RollbackOutcome) {
        let snapshot = &target.working_tree_snapshot;
        let Some(data) = snapshot.compressed_data.as_deref().filter(|_| snapshot.available) else {
            outcome.warnings.push("record has no working-tree archive".to_string());
            return;
        };

        if snapshot.compression.as_deref() != Some(archive::COMPRESSION) {
            outcome.errors.push(format!(
                "unsupported archive compression: {}",
                snapshot.compression.as_deref().unwrap_or("none")
            ));
            return;
        }

        match archive::restore(data, self.manager.layout().root(), self.manager.policy()) {
            Ok(report) => {
                outcome.restored_count = report.restored.len();
                outcome.errors.extend(report.errors);
            }
            Err(e) => {
                warn!("Archive of {} could not be decoded: {}", target.backup_id, e);
                outcome.errors.push(format!("archive could not be decoded: {e}"));
            }
        }
    }

    /// Delete included files absent from the target's file set.
    fn mirror_delete(&self, target: &BackupRecord, outcome: &mut RollbackOutcome) {
        let Some(keep) = self.target_paths(target, outcome) else {
            outcome
                .warnings
                .push("mirror skipped: the record's file set is unknown".to_string());
            return;
        };

        let mut policy: InclusionPolicy = target
            .working_tree_snapshot
            .inclusion
            .clone()
            .unwrap_or_else(|| self.manager.policy().clone());
        // Tool state and VCS metadata are never candidates, whatever the
        // record's policy said.
        policy
            .excluded_names
            .extend(self.manager.policy().excluded_names.iter().cloned());

        let root = self.manager.layout().root();
        let files = match walk_directory(root, &WalkOptions::with_policy(policy)) {
            Ok(files) => files,
            Err(e) => {
                outcome.errors.push(format!("mirror walk failed: {e}"));
                return;
            }
        };

        for file in files.iter().filter(|f| !keep.contains(&f.relative_path)) {
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    info!("Mirror removed {}", file.relative_path);
                    outcome.deleted_count += 1;
                }
                Err(e) => outcome.errors.push(format!("{}: cannot delete: {e}", file.relative_path)),
            }
        }
    }

    fn target_paths(&self, target: &BackupRecord, outcome: &mut RollbackOutcome) -> Option<BTreeSet<String>> {
        if !target.sih_snapshot.is_empty() {
            return Some(target.sih_snapshot.paths().map(str::to_string).collect());
        }
        let data = target.working_tree_snapshot.compressed_data.as_deref()?;
        match archive::list_paths(data) {
            Ok(paths) => Some(paths),
            Err(e) => {
                outcome.warnings.push(format!("cannot list archive: {e}"));
                None
            }
        }
    }

    fn finish(&self, target: &BackupRecord, outcome: &mut RollbackOutcome) {
        let root = self.manager.layout().root();

        match self.manager.archive_index().build(root) {
            Ok(after) => outcome.residual_drift = diff(&target.sih_snapshot, &after),
            Err(e) => outcome.warnings.push(format!("post-restore snapshot failed: {e}")),
        }

        let mut state = StateFile::from_value(&target.pre_change_checkpoint);
        state.current_state = "rolled_back".to_string();
        state.backup_ref = Some(self.manager.layout().backup_ref(&target.file_name()));
        state.touch(format!("rollback_from_{}", target.file_name()));
        if let Err(e) = self.manager.refresh_integrity(&mut state) {
            outcome.warnings.push(format!("state integrity not refreshed: {e}"));
        }
        if let Err(e) = state.save(&self.manager.layout().state_file()) {
            warn!("Could not write state file after rollback: {}", e);
            outcome.warnings.push(format!("state file not updated: {e}"));
        }

        let severity = if outcome.errors.is_empty() {
            Severity::Info
        } else {
            Severity::Error
        };
        self.manager.audit().log_quietly(
            ACTOR,
            "rollback_completed",
            &outcome.target_id,
            json!({
                "safety_record_id": outcome.safety_record_id,
                "restored": outcome.restored_count,
                "deleted": outcome.deleted_count,
                "errors": outcome.errors,
                "warnings": outcome.warnings,
                "residual_drift": outcome.residual_drift.changed_count(),
            }),
            severity,
        );

        info!(
            target = %outcome.target_id,
            restored = outcome.restored_count,
            deleted = outcome.deleted_count,
            errors = outcome.errors.len(),
            "Rollback finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::tests::{lock, manager, manager_with_vcs, FakeVcs, PATCH};
    use std::collections::BTreeMap;
    use std::io;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn project() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("pkg")).unwrap();
        fs::write(root.join("pkg/core.py"), "def f():\n    return 1\n").unwrap();
        fs::write(root.join("config.toml"), "[a]\nb = 1\n").unwrap();
        fs::write(root.join("notes.bin"), [9u8, 9, 9]).unwrap();
        temp_dir
    }

    fn read(root: &Path, rel: &str) -> Vec<u8> {
        fs::read(root.join(rel)).unwrap()
    }

    /// Every project file outside `.odin/` with its bytes.
    fn project_files(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".odin")
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_backup_then_rollback_restores_bytes() {
        let temp_dir = project();
        let root = temp_dir.path();
        let manager = manager(root);
        let guard = lock(root);
        assert!(manager.list_backups(None).is_empty());

        let before_core = read(root, "pkg/core.py");
        let before_cfg = read(root, "config.toml");
        let record = manager.create_backup(&guard, "pre_deploy").unwrap();

        fs::write(root.join("pkg/core.py"), "def f():\n    return 2\n").unwrap();
        fs::remove_file(root.join("config.toml")).unwrap();

        let outcome = RollbackEngine::new(&manager)
            .rollback_to(&guard, &record.backup_id, false)
            .unwrap();

        assert!(outcome.is_success(), "{:?}", outcome.errors);
        assert_eq!(outcome.restored_count, 2);
        assert!(!outcome.residual_drift.has_changes());
        assert_eq!(read(root, "pkg/core.py"), before_core);
        assert_eq!(read(root, "config.toml"), before_cfg);

        let listed = manager.list_backups(None);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, outcome.safety_record_id);
        assert_eq!(listed[0].rollback_target.as_deref(), Some(record.backup_id.as_str()));

        let state = StateFile::load(&manager.layout().state_file());
        assert_eq!(state.current_state, "rolled_back");
    }

    #[test]
    fn test_unknown_record_creates_no_safety_backup() {
        let temp_dir = project();
        let root = temp_dir.path();
        let manager = manager(root);
        let guard = lock(root);
        manager.create_backup(&guard, "only").unwrap();

        let result = RollbackEngine::new(&manager).rollback_to(&guard, "nonexistent", false);
        assert!(matches!(result, Err(RollbackError::NotFound(_))));
        assert_eq!(manager.list_backups(None).len(), 1);
    }

    #[test]
    fn test_mirror_deletes_only_unknown_included_files() {
        let temp_dir = project();
        let root = temp_dir.path();
        let manager = manager(root);
        let guard = lock(root);
        let record = manager.create_backup(&guard, "base").unwrap();

        fs::write(root.join("pkg/extra.py"), "x = 1\n").unwrap();
        fs::write(root.join("scratch.bin"), [1u8]).unwrap();

        let engine = RollbackEngine::new(&manager);
        let plain = engine.rollback_to(&guard, &record.backup_id, false).unwrap();
        assert_eq!(plain.deleted_count, 0);
        assert!(root.join("pkg/extra.py").exists());

        let mirrored = engine.rollback_to(&guard, &record.backup_id, true).unwrap();
        assert_eq!(mirrored.deleted_count, 1);
        assert!(!root.join("pkg/extra.py").exists());
        // Not an included file type: never a mirror candidate.
        assert!(root.join("scratch.bin").exists());
        assert!(root.join("notes.bin").exists());
        // Tool state survives.
        assert!(manager.layout().backups_dir().is_dir());
    }

    #[test]
    fn test_partial_restore_still_reports_safety_backup() {
        let temp_dir = project();
        let root = temp_dir.path();
        let manager = manager(root);
        let guard = lock(root);
        let record = manager.create_backup(&guard, "base").unwrap();

        // A directory where a file must be restored makes that file fail.
        fs::remove_file(root.join("config.toml")).unwrap();
        fs::create_dir(root.join("config.toml")).unwrap();
        fs::write(root.join("config.toml/inner.txt"), "x").unwrap();

        let outcome = RollbackEngine::new(&manager)
            .rollback_to(&guard, &record.backup_id, false)
            .unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.restored_count, 1);
        assert!(manager.load_record(&outcome.safety_record_id).is_ok());

        match outcome.into_result() {
            Err(RollbackError::PartialRestore { restored, safety_record_id, .. }) => {
                assert_eq!(restored, 1);
                assert!(!safety_record_id.is_empty());
            }
            other => panic!("expected partial restore, got {other:?}"),
        }
    }

    #[test]
    fn test_rollback_last_skips_safety_records() {
        let temp_dir = project();
        let root = temp_dir.path();
        let manager = manager(root);
        let guard = lock(root);
        let engine = RollbackEngine::new(&manager);

        assert!(matches!(engine.rollback_last(&guard, false), Err(RollbackError::NotFound(_))));

        let record = manager.create_backup(&guard, "base").unwrap();
        engine.rollback_to(&guard, &record.backup_id, false).unwrap();

        // The newest record is now a safety record; rollback-last ignores it.
        let outcome = engine.rollback_last(&guard, false).unwrap();
        assert_eq!(outcome.target_id, record.backup_id);
    }

    #[test]
    fn test_long_paths_round_trip_through_rollback() {
        let temp_dir = project();
        let root = temp_dir.path();
        let dir = "src/main/java/com/example/platform/service/internal/http/server/request/handlers";
        let long = format!("{dir}/RequestHandlerFactory.java");
        assert!(long.len() > 100);
        fs::create_dir_all(root.join(dir)).unwrap();
        fs::write(root.join(&long), "class RequestHandlerFactory {}\n").unwrap();

        let manager = manager(root);
        let guard = lock(root);
        let record = manager.create_backup(&guard, "long_paths").unwrap();
        assert!(record.warnings.is_empty(), "{:?}", record.warnings);
        assert!(record.sih_snapshot.contains(&long));

        fs::write(root.join(&long), "class Broken {}\n").unwrap();
        fs::write(root.join("pkg/core.py"), "def f():\n    return 2\n").unwrap();

        let outcome = RollbackEngine::new(&manager)
            .rollback_to(&guard, &record.backup_id, false)
            .unwrap();
        assert!(outcome.is_success(), "{:?}", outcome.errors);
        assert_eq!(read(root, &long), b"class RequestHandlerFactory {}\n");
        assert_eq!(read(root, "pkg/core.py"), b"def f():\n    return 1\n");
    }

    #[test]
    fn test_failed_safety_backup_touches_nothing() {
        let temp_dir = project();
        let root = temp_dir.path();
        let guard = lock(root);
        let record = manager(root).create_backup(&guard, "base").unwrap();

        fs::write(root.join("pkg/core.py"), "def f():\n    return 2\n").unwrap();
        let before = project_files(root);

        let failing = manager(root).with_publish(|_, _| Err(io::Error::other("disk full")));
        let result = RollbackEngine::new(&failing).rollback_to(&guard, &record.backup_id, false);

        assert!(matches!(result, Err(RollbackError::SafetyCheckpointFailed(_))));
        assert_eq!(project_files(root), before);
        let ids: Vec<_> = failing.list_backups(None).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![record.backup_id]);
    }

    #[test]
    fn test_rollback_reverses_recorded_patch() {
        let temp_dir = project();
        let root = temp_dir.path();
        let vcs = Arc::new(FakeVcs {
            diff: Some(PATCH.to_string()),
            ..Default::default()
        });
        let manager = manager_with_vcs(root, Arc::clone(&vcs));
        let guard = lock(root);
        let record = manager.create_backup(&guard, "patched").unwrap();

        let outcome = RollbackEngine::new(&manager)
            .rollback_to(&guard, &record.backup_id, false)
            .unwrap();
        assert!(outcome.patch_reverted);
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        assert_eq!(*vcs.reversed.lock().unwrap(), vec![PATCH.to_string()]);
    }

    #[test]
    fn test_failed_patch_reversal_is_a_warning() {
        let temp_dir = project();
        let root = temp_dir.path();
        let vcs = Arc::new(FakeVcs {
            diff: Some(PATCH.to_string()),
            reverse_error: Some("patch does not apply".to_string()),
            ..Default::default()
        });
        let manager = manager_with_vcs(root, vcs);
        let guard = lock(root);
        let record = manager.create_backup(&guard, "patched").unwrap();
        fs::write(root.join("pkg/core.py"), "def f():\n    return 2\n").unwrap();

        let outcome = RollbackEngine::new(&manager)
            .rollback_to(&guard, &record.backup_id, false)
            .unwrap();
        assert!(!outcome.patch_reverted);
        assert!(outcome.is_success(), "{:?}", outcome.errors);
        assert_eq!(outcome.warnings, vec!["reverse patch failed: patch does not apply".to_string()]);
        assert_eq!(read(root, "pkg/core.py"), b"def f():\n    return 1\n");
    }
}
