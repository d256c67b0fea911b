//! Facade tying the components together for one project root.
//!
//! Every mutating operation takes the `LockGuard` returned by
//! [`OdinEngine::lock`]; read-only listings do not, and may observe a
//! backup or rollback that is still in progress in another process.

use crate::audit::report::AuditReport;
use crate::audit::{summarize, AuditFilter, Severity};
use crate::backup::{BackupManager, BackupRecord, BackupSummary, ACTOR};
use crate::config::OdinConfig;
use crate::daemon::lock::{self, LockGuard, LockOptions};
use crate::integrity::{combined_hash, IntegrityMonitor};
use crate::layout::Layout;
use crate::retention::{RetentionPlan, RetentionPolicy, RetentionReport};
use crate::rollback::{RollbackEngine, RollbackOutcome};
use crate::state::{CheckpointKind, StateFile};
use crate::utils::errors::{IntegrityError, OdinError, Result};
use crate::utils::fsutil::atomic_write;
use crate::vcs::{GitCli, Vcs};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Backups listed in a full audit report
const REPORT_BACKUPS: usize = 5;

pub struct OdinEngine {
    layout: Layout,
    config: OdinConfig,
    manager: BackupManager,
}

#[derive(Debug)]
pub struct InitOutcome {
    pub config_created: bool,
    pub state_created: bool,
    pub backup: BackupRecord,
    pub report: AuditReport,
}

impl OdinEngine {
    /// Engine for `root` using `git` when the root is a repository.
    pub fn open(root: impl Into<PathBuf>, config: OdinConfig) -> Result<Self> {
        Self::with_vcs(root, config, Arc::new(GitCli::new()))
    }

    pub fn with_vcs(root: impl Into<PathBuf>, config: OdinConfig, vcs: Arc<dyn Vcs>) -> Result<Self> {
        let root: PathBuf = root.into();
        if !root.is_dir() {
            return Err(IntegrityError::InvalidRoot(root).into());
        }
        let root = root.canonicalize()?;
        let layout = Layout::new(root);
        let manager = BackupManager::new(layout.clone(), &config, vcs);
        Ok(Self {
            layout,
            config,
            manager,
        })
    }

    /// Open `root` with the config at `config_path`, or the project's own
    /// `.odin/config.toml`, or defaults.
    pub fn load(root: impl Into<PathBuf>, config_path: Option<&Path>) -> Result<Self> {
        let root: PathBuf = root.into();
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Layout::new(&root).config_file());
        let config = OdinConfig::load_or_default(&path)?;
        Self::open(root, config)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &OdinConfig {
        &self.config
    }

    pub fn manager(&self) -> &BackupManager {
        &self.manager
    }

    /// Acquire the instance lock for this root.
    pub fn lock(&self) -> Result<LockGuard> {
        Ok(lock::acquire(self.layout.root(), &LockOptions::from(&self.config.lock))?)
    }

    /// Scaffold `.odin/`, capture the baseline, take the first backup and
    /// write the first audit report. Existing config and state are kept.
    pub fn init(&self, lock: &LockGuard) -> Result<InitOutcome> {
        self.manager.check_lock(lock)?;
        self.layout.ensure_scaffold()?;

        let config_path = self.layout.config_file();
        let config_created = !config_path.exists();
        if config_created {
            atomic_write(&config_path, self.config.to_toml()?.as_bytes())?;
        }

        let state_path = self.layout.state_file();
        let state_created = !state_path.exists();
        if state_created {
            let mut state = StateFile {
                current_state: "initialized".to_string(),
                ..Default::default()
            };
            state.touch("init");
            self.manager.refresh_integrity(&mut state)?;
            state.save(&state_path)?;
        }

        let backup = self.manager.create_backup_as(lock, "init", CheckpointKind::Milestone)?;
        let report = self.audit(lock, false)?;

        self.manager.audit().log_quietly(
            ACTOR,
            "init",
            &self.layout.root().display().to_string(),
            json!({ "config_created": config_created, "state_created": state_created, "backup_id": backup.backup_id }),
            Severity::Info,
        );
        info!("Project initialized at {}", self.layout.root().display());

        Ok(InitOutcome {
            config_created,
            state_created,
            backup,
            report,
        })
    }

    /// Compare the tree with the baseline in the state file and write the
    /// markdown report. The first audit of a project captures the baseline.
    pub fn audit(&self, lock: &LockGuard, full: bool) -> Result<AuditReport> {
        self.manager.check_lock(lock)?;
        self.layout.ensure_scaffold()?;
        let state_path = self.layout.state_file();
        let mut state = StateFile::load(&state_path);

        let (current, drift, baseline_created) = match state.sih_snapshot.clone() {
            Some(baseline) => {
                let monitor = IntegrityMonitor::new(self.manager.tree_index().clone(), self.layout.root())
                    .with_baseline(baseline);
                let (current, drift) = monitor.scan()?;
                (current, drift, false)
            }
            None => {
                let mut monitor =
                    IntegrityMonitor::new(self.manager.tree_index().clone(), self.layout.root());
                let baseline = monitor.capture_baseline()?.clone();
                self.manager.refresh_integrity(&mut state)?;
                let drift = crate::integrity::diff(&baseline, &baseline);
                (baseline, drift, true)
            }
        };

        let now = Utc::now();
        state
            .extra
            .insert("last_audit".to_string(), Value::String(now.to_rfc3339()));
        if let Err(e) = state.save(&state_path) {
            warn!("Could not update state file: {}", e);
        }

        let tracked_files = drift.added.len() + drift.modified.len() + drift.unchanged.len();
        let mut report = AuditReport {
            generated_at: now,
            project_root: self.layout.root().display().to_string(),
            baseline_created,
            tracked_files,
            semantic_hash: combined_hash(&current),
            drift,
            recent_backups: Vec::new(),
            anomalies: Vec::new(),
            activity: None,
        };

        if full {
            report.recent_backups = self.manager.list_backups(Some(REPORT_BACKUPS));
            let trail = self.manager.audit();
            let window = Duration::hours(self.config.audit.window_hours);
            match trail.detect_anomalies(window, &self.config.audit) {
                Ok(anomalies) => report.anomalies = anomalies,
                Err(e) => warn!("Audit trail unreadable: {}", e),
            }
            match trail.query(&AuditFilter::default(), Some(now - window), Some(now)) {
                Ok(entries) => report.activity = Some(summarize(&entries)),
                Err(e) => warn!("Audit trail unreadable: {}", e),
            }
        }

        atomic_write(&self.layout.audit_report(), report.to_markdown(full).as_bytes())?;

        let severity = if report.drift.has_changes() {
            Severity::Warning
        } else {
            Severity::Info
        };
        self.manager.audit().log_quietly(
            ACTOR,
            "integrity_audit",
            &self.layout.audit_report().display().to_string(),
            json!({
                "status": report.status(),
                "added": report.drift.added.len(),
                "removed": report.drift.removed.len(),
                "modified": report.drift.modified.len(),
                "full": full,
            }),
            severity,
        );

        Ok(report)
    }

    /// A user-requested backup (MANUAL checkpoint).
    pub fn backup(&self, lock: &LockGuard, reason: &str) -> Result<BackupRecord> {
        Ok(self.manager.create_backup_as(lock, reason, CheckpointKind::Manual)?)
    }

    pub fn rollback_to(&self, lock: &LockGuard, id: &str, mirror: bool) -> Result<RollbackOutcome> {
        Ok(RollbackEngine::new(&self.manager).rollback_to(lock, id, mirror)?)
    }

    pub fn rollback_last(&self, lock: &LockGuard, mirror: bool) -> Result<RollbackOutcome> {
        Ok(RollbackEngine::new(&self.manager).rollback_last(lock, mirror)?)
    }

    /// Retention policy for a cleanup: `keep` overrides the configured floor,
    /// and the age condition applies only when `max_age_days` is given.
    pub fn cleanup_policy(&self, keep: Option<usize>, max_age_days: Option<u64>) -> RetentionPolicy {
        RetentionPolicy::new(
            keep.unwrap_or(self.config.retention.keep_minimum),
            Duration::days(max_age_days.unwrap_or(0).min(1_000_000) as i64),
        )
    }

    /// Preview of what [`cleanup`](Self::cleanup) would delete now. Needs no
    /// lock, so the result is only advisory.
    pub fn cleanup_plan(&self, policy: &RetentionPolicy) -> RetentionPlan {
        policy.plan(&self.manager, Utc::now())
    }

    /// Plan again under the lock and delete what the policy selects.
    pub fn cleanup(&self, lock: &LockGuard, policy: &RetentionPolicy) -> Result<RetentionReport> {
        Ok(policy.prune(&self.manager, lock)?)
    }

    pub fn list_backups(&self, limit: Option<usize>) -> Vec<BackupSummary> {
        self.manager.list_backups(limit)
    }

    pub fn show_backup(&self, id: &str) -> Result<BackupSummary> {
        self.manager.show_backup(id).map_err(OdinError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::BackupError;
    use crate::vcs::NoVcs;
    use std::fs;
    use tempfile::TempDir;

    fn engine(root: &Path) -> OdinEngine {
        OdinEngine::with_vcs(root, OdinConfig::default(), Arc::new(NoVcs)).unwrap()
    }


    #[test]
    fn test_open_rejects_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let result = OdinEngine::with_vcs(temp_dir.path().join("nope"), OdinConfig::default(), Arc::new(NoVcs));
        assert!(matches!(result, Err(OdinError::Integrity(IntegrityError::InvalidRoot(_)))));
    }

    #[test]
    fn test_init_scaffolds_and_backs_up() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("main.py"), "print('hi')\n").unwrap();
        let engine = engine(temp_dir.path());
        let guard = engine.lock().unwrap();

        let outcome = engine.init(&guard).unwrap();
        assert!(outcome.config_created);
        assert!(outcome.state_created);
        assert!(!outcome.report.drift.has_changes());
        assert!(engine.layout().config_file().exists());
        assert!(engine.layout().audit_report().exists());
        assert_eq!(engine.list_backups(None).len(), 1);

        let checkpoints = engine.manager().checkpoints().list(None, None);
        assert_eq!(checkpoints[0].kind, CheckpointKind::Milestone);

        // A second init keeps the existing files.
        let again = engine.init(&guard).unwrap();
        assert!(!again.config_created);
        assert!(!again.state_created);
    }

    #[test]
    fn test_audit_reports_drift_against_baseline() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.py"), "x=1\n# note\n").unwrap();
        let engine = engine(root);
        let guard = engine.lock().unwrap();

        let first = engine.audit(&guard, false).unwrap();
        assert!(first.baseline_created);

        fs::write(root.join("a.py"), "x=1\n# other note\n").unwrap();
        assert_eq!(engine.audit(&guard, false).unwrap().status(), "CLEAN");

        fs::write(root.join("b.py"), "y=2\n").unwrap();
        let report = engine.audit(&guard, true).unwrap();
        assert_eq!(report.drift.added, vec!["b.py"]);
        assert!(report.activity.is_some());

        let md = fs::read_to_string(engine.layout().audit_report()).unwrap();
        assert!(md.contains("DRIFT DETECTED"));
        assert!(md.contains("`b.py`"));
    }

    #[test]
    fn test_backup_moves_audit_baseline() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.py"), "x=1\n").unwrap();
        let engine = engine(root);
        let guard = engine.lock().unwrap();
        engine.audit(&guard, false).unwrap();

        fs::write(root.join("a.py"), "x=2\n").unwrap();
        assert!(engine.audit(&guard, false).unwrap().drift.has_changes());

        engine.backup(&guard, "accept change").unwrap();
        assert!(!engine.audit(&guard, false).unwrap().drift.has_changes());
    }

    #[test]
    fn test_audit_reports_hash_of_current_tree() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.py"), "x=1\n").unwrap();
        let engine = engine(root);
        let guard = engine.lock().unwrap();
        let first = engine.audit(&guard, false).unwrap();

        fs::write(root.join("a.py"), "x=2\n").unwrap();
        let report = engine.audit(&guard, false).unwrap();
        let current = engine.manager().tree_index().build(root).unwrap();
        assert_ne!(report.semantic_hash, first.semantic_hash);
        assert_eq!(report.semantic_hash, combined_hash(&current));

        let md = fs::read_to_string(engine.layout().audit_report()).unwrap();
        assert!(md.contains(&report.semantic_hash));
    }

    #[test]
    fn test_operations_refuse_another_roots_lock() {
        let project = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let foreign = engine(other.path()).lock().unwrap();
        let engine = engine(project.path());

        assert!(matches!(
            engine.audit(&foreign, false),
            Err(OdinError::Backup(BackupError::ForeignLock { .. }))
        ));
        assert!(engine.init(&foreign).is_err());
        assert!(!engine.layout().state_file().exists());
        let policy = engine.cleanup_policy(Some(0), None);
        assert!(engine.cleanup(&foreign, &policy).is_err());
    }

    #[test]
    fn test_cleanup_plans_again_under_the_lock() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.py"), "x=1\n").unwrap();
        let engine = engine(root);
        let policy = engine.cleanup_policy(Some(1), None);
        {
            let guard = engine.lock().unwrap();
            engine.backup(&guard, "one").unwrap();
            engine.backup(&guard, "two").unwrap();
        }

        // Preview without the lock, then another backup lands before cleanup runs.
        let preview = engine.cleanup_plan(&policy);
        assert_eq!(preview.backups.len(), 1);
        let guard = engine.lock().unwrap();
        let newest = engine.backup(&guard, "three").unwrap();

        let report = engine.cleanup(&guard, &policy).unwrap();
        assert_eq!(report.deleted_backups.len(), 2);
        assert_eq!(report.remaining_backups, 1);
        let left = engine.list_backups(None);
        assert_eq!(left[0].id, newest.backup_id);
    }

    #[test]
    fn test_cleanup_policy_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(temp_dir.path());
        let policy = engine.cleanup_policy(Some(3), None);
        assert_eq!(policy.keep_minimum, 3);
        assert_eq!(policy.max_age, None);
        assert_eq!(engine.cleanup_policy(None, Some(7)).keep_minimum, 5);
    }

    #[test]
    fn test_load_reads_project_config() {
        let temp_dir = TempDir::new().unwrap();
        let layout = Layout::new(temp_dir.path());
        layout.ensure_scaffold().unwrap();
        fs::write(layout.config_file(), "[retention]\nkeep_minimum = 9\n").unwrap();

        let engine = OdinEngine::load(temp_dir.path(), None).unwrap();
        assert_eq!(engine.config().retention.keep_minimum, 9);
    }
}
