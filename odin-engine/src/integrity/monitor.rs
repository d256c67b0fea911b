//! Baseline drift monitoring.

use super::snapshot::{diff, DriftReport, Snapshot, SnapshotIndex};
use crate::utils::errors::IntegrityError;
use std::path::{Path, PathBuf};
use tracing::info;

/// Holds one baseline snapshot of a root and compares the live tree to it.
///
/// Checking never moves the baseline; only [`capture_baseline`] does.
///
/// [`capture_baseline`]: IntegrityMonitor::capture_baseline
pub struct IntegrityMonitor {
    index: SnapshotIndex,
    root: PathBuf,
    baseline: Option<Snapshot>,
}

impl IntegrityMonitor {
    pub fn new(index: SnapshotIndex, root: impl Into<PathBuf>) -> Self {
        Self {
            index,
            root: root.into(),
            baseline: None,
        }
    }

    /// Start from a baseline persisted elsewhere (e.g. the state file)
    pub fn with_baseline(mut self, baseline: Snapshot) -> Self {
        self.baseline = Some(baseline);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn baseline(&self) -> Option<&Snapshot> {
        self.baseline.as_ref()
    }

    /// Snapshot the tree and make it the baseline, replacing any previous one.
    pub fn capture_baseline(&mut self) -> Result<&Snapshot, IntegrityError> {
        let snapshot = self.index.build(&self.root)?;
        info!("Baseline captured: {} files", snapshot.len());
        Ok(self.baseline.insert(snapshot))
    }

    pub fn check_drift(&self) -> Result<DriftReport, IntegrityError> {
        Ok(self.scan()?.1)
    }

    /// Snapshot the live tree and diff it against the baseline, returning both.
    pub fn scan(&self) -> Result<(Snapshot, DriftReport), IntegrityError> {
        let baseline = self.baseline.as_ref().ok_or(IntegrityError::NoBaseline)?;
        let current = self.index.build(&self.root)?;
        let drift = diff(baseline, &current);
        Ok((current, drift))
    }

    pub fn has_changes(&self) -> Result<bool, IntegrityError> {
        Ok(self.check_drift()?.has_changes())
    }
}
