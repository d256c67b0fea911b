//! Pruning of old backup records and checkpoints.
//!
//! Items are ordered oldest first; everything but the `keep_minimum` newest
//! is a candidate, and a candidate is deleted only when it is older than
//! `max_age`. A zero `max_age` drops the age condition. The count never goes
//! below `keep_minimum`.

use crate::audit::Severity;
use crate::backup::{BackupManager, BackupSummary, ACTOR};
use crate::config::RetentionConfig;
use crate::daemon::lock::LockGuard;
use crate::state::checkpoint::remove_checkpoint_dir;
use crate::utils::errors::BackupError;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_minimum: usize,
    /// `None` means age is not considered
    pub max_age: Option<Duration>,
}

/// What a prune would delete
#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    pub backups: Vec<BackupSummary>,
    pub checkpoints: Vec<PathBuf>,
    pub total_backups: usize,
    pub total_checkpoints: usize,
}

impl RetentionPlan {
    pub fn is_empty(&self) -> bool {
        self.backups.is_empty() && self.checkpoints.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub deleted_backups: Vec<String>,
    pub deleted_checkpoints: Vec<String>,
    pub remaining_backups: usize,
    pub remaining_checkpoints: usize,
    pub errors: Vec<String>,
}

impl RetentionPolicy {
    pub fn new(keep_minimum: usize, max_age: Duration) -> Self {
        Self {
            keep_minimum,
            max_age: (max_age > Duration::zero()).then_some(max_age),
        }
    }

    pub fn from_config(config: &RetentionConfig) -> Self {
        // Anything beyond ~2700 years is as good as "forever".
        Self::new(config.keep_minimum, Duration::days(config.max_age_days.min(1_000_000) as i64))
    }

    /// Pick the items to delete from `(item, created_at)` pairs.
    pub fn select<T>(&self, mut items: Vec<(T, DateTime<Utc>)>, now: DateTime<Utc>) -> Vec<T> {
        items.sort_by_key(|(_, at)| *at);
        let candidates = items.len().saturating_sub(self.keep_minimum);

        items
            .into_iter()
            .take(candidates)
            .filter(|(_, at)| self.max_age.map_or(true, |max| now - *at > max))
            .map(|(item, _)| item)
            .collect()
    }

    pub fn plan(&self, manager: &BackupManager, now: DateTime<Utc>) -> RetentionPlan {
        let backups: Vec<_> = manager
            .list_backups(None)
            .into_iter()
            .map(|summary| {
                let at = summary.created_at;
                (summary, at)
            })
            .collect();
        let checkpoints = manager.checkpoints().entries();

        RetentionPlan {
            total_backups: backups.len(),
            total_checkpoints: checkpoints.len(),
            backups: self.select(backups, now),
            checkpoints: self.select(checkpoints, now),
        }
    }

    /// Delete what [`plan`](Self::plan) selects.
    ///
    /// A record is one file, removed with a single unlink. A checkpoint loses
    /// its manifest before the rest of its directory. Failures are collected
    /// and do not stop the pass.
    pub fn prune(&self, manager: &BackupManager, lock: &LockGuard) -> Result<RetentionReport, BackupError> {
        let plan = self.plan(manager, Utc::now());
        self.execute(manager, lock, plan)
    }

    /// Delete exactly what `plan` lists. Fails only when `lock` belongs to
    /// another root.
    pub fn execute(
        &self,
        manager: &BackupManager,
        lock: &LockGuard,
        plan: RetentionPlan,
    ) -> Result<RetentionReport, BackupError> {
        manager.check_lock(lock)?;
        let mut report = RetentionReport::default();

        for summary in &plan.backups {
            match fs::remove_file(&summary.path) {
                Ok(()) => {
                    info!(backup_id = %summary.id, "Deleted old backup");
                    report.deleted_backups.push(summary.id.clone());
                }
                Err(e) => {
                    warn!(backup_id = %summary.id, "Cannot delete backup: {}", e);
                    report.errors.push(format!("{}: {e}", summary.id));
                }
            }
        }

        for dir in &plan.checkpoints {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match remove_checkpoint_dir(dir) {
                Ok(()) => {
                    info!(checkpoint_id = %name, "Deleted old checkpoint");
                    report.deleted_checkpoints.push(name);
                }
                Err(e) => {
                    warn!(checkpoint_id = %name, "Cannot delete checkpoint: {}", e);
                    report.errors.push(format!("{name}: {e}"));
                }
            }
        }

        report.remaining_backups = plan.total_backups - report.deleted_backups.len();
        report.remaining_checkpoints = plan.total_checkpoints - report.deleted_checkpoints.len();

        manager.audit().log_quietly(
            ACTOR,
            "cleanup",
            "backups",
            json!({
                "keep_minimum": self.keep_minimum,
                "max_age_days": self.max_age.map(|d| d.num_days()),
                "deleted_backups": report.deleted_backups.len(),
                "deleted_checkpoints": report.deleted_checkpoints.len(),
                "errors": report.errors,
            }),
            if report.errors.is_empty() { Severity::Info } else { Severity::Warning },
        );
        Ok(report)
    }
}
