//! Scoped backup guard for risky operations.
//!
//! `begin` takes a PRE_CHANGE backup and returns a guard. The guard records
//! how the scope ended: `complete` logs success, and dropping it without
//! completing logs a failure. Either way exactly one outcome entry is written.

use super::{BackupManager, BackupRecord, ACTOR};
use crate::audit::Severity;
use crate::daemon::lock::LockGuard;
use crate::state::CheckpointKind;
use crate::utils::errors::BackupError;
use serde_json::json;
use tracing::{error, info};

pub struct BackupScope<'a> {
    manager: &'a BackupManager,
    operation: String,
    record: BackupRecord,
    finished: bool,
}

impl<'a> BackupScope<'a> {
    pub fn begin(
        manager: &'a BackupManager,
        lock: &LockGuard,
        operation: &str,
    ) -> Result<Self, BackupError> {
        let record = manager.create_backup_as(lock, &format!("pre_{operation}"), CheckpointKind::PreChange)?;
        Ok(Self {
            manager,
            operation: operation.to_string(),
            record,
            finished: false,
        })
    }

    /// The backup taken when the scope began
    pub fn record(&self) -> &BackupRecord {
        &self.record
    }

    pub fn complete(mut self) {
        self.finished = true;
        info!(operation = %self.operation, backup_id = %self.record.backup_id, "Operation completed");
        self.log_outcome("operation_completed", Severity::Info);
    }

    /// Run `f` inside a scope: begin, run, complete on `Ok`.
    ///
    /// On `Err` the scope is dropped and the failure logged; the backup taken
    /// at the start stays available for a rollback.
    pub fn run<T, E, F>(
        manager: &'a BackupManager,
        lock: &LockGuard,
        operation: &str,
        f: F,
    ) -> Result<Result<T, E>, BackupError>
    where
        F: FnOnce(&BackupRecord) -> Result<T, E>,
    {
        let scope = Self::begin(manager, lock, operation)?;
        let outcome = f(&scope.record);
        if outcome.is_ok() {
            scope.complete();
        }
        Ok(outcome)
    }

    fn log_outcome(&self, action: &str, severity: Severity) {
        self.manager.audit().log_quietly(
            ACTOR,
            action,
            &self.record.backup_id,
            json!({ "operation": self.operation }),
            severity,
        );
    }
}

impl Drop for BackupScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            error!(
                operation = %self.operation,
                backup_id = %self.record.backup_id,
                "Operation failed; roll back with this backup id if needed"
            );
            self.log_outcome("operation_failed", Severity::Error);
        }
    }
}
