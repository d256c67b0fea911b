//! Markdown report written by `odin audit`.

use super::{Anomaly, AuditSummary};
use crate::backup::BackupSummary;
use crate::integrity::DriftReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;

/// Cap on paths listed per drift category
const MAX_LISTED: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub project_root: String,
    /// True when this run captured the baseline (nothing to compare yet)
    pub baseline_created: bool,
    pub tracked_files: usize,
    /// Combined semantic hash of the tree as this audit scanned it
    pub semantic_hash: String,
    pub drift: DriftReport,
    pub recent_backups: Vec<BackupSummary>,
    pub anomalies: Vec<Anomaly>,
    pub activity: Option<AuditSummary>,
}

impl AuditReport {
    pub fn status(&self) -> &'static str {
        if self.baseline_created {
            "BASELINE CAPTURED"
        } else if self.drift.has_changes() {
            "DRIFT DETECTED"
        } else {
            "CLEAN"
        }
    }

    pub fn to_markdown(&self, full: bool) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = self.write_markdown(&mut out, full);
        out
    }

    fn write_markdown(&self, out: &mut String, full: bool) -> std::fmt::Result {
        writeln!(out, "# ODIN Integrity Audit")?;
        writeln!(out)?;
        writeln!(out, "- Generated: {}", self.generated_at.to_rfc3339())?;
        writeln!(out, "- Project: `{}`", self.project_root)?;
        writeln!(out, "- Status: **{}**", self.status())?;
        writeln!(out, "- Tracked files: {}", self.tracked_files)?;
        writeln!(out, "- Semantic hash: `{}`", self.semantic_hash)?;
        writeln!(out)?;

        writeln!(out, "## Drift")?;
        writeln!(out)?;
        writeln!(out, "| Added | Removed | Modified | Unchanged |")?;
        writeln!(out, "|---|---|---|---|")?;
        writeln!(
            out,
            "| {} | {} | {} | {} |",
            self.drift.added.len(),
            self.drift.removed.len(),
            self.drift.modified.len(),
            self.drift.unchanged.len()
        )?;

        if !full {
            return Ok(());
        }

        for (title, paths) in [
            ("Added", &self.drift.added),
            ("Removed", &self.drift.removed),
            ("Modified", &self.drift.modified),
        ] {
            if paths.is_empty() {
                continue;
            }
            writeln!(out)?;
            writeln!(out, "### {title}")?;
            writeln!(out)?;
            for path in paths.iter().take(MAX_LISTED) {
                writeln!(out, "- `{path}`")?;
            }
            if paths.len() > MAX_LISTED {
                writeln!(out, "- ... and {} more", paths.len() - MAX_LISTED)?;
            }
        }

        writeln!(out)?;
        writeln!(out, "## Recent backups")?;
        writeln!(out)?;
        if self.recent_backups.is_empty() {
            writeln!(out, "None.")?;
        }
        for backup in &self.recent_backups {
            writeln!(
                out,
                "- `{}` {} ({} files{})",
                backup.id,
                backup.reason,
                backup.files_count,
                if backup.is_safety_record() { ", safety" } else { "" }
            )?;
        }

        writeln!(out)?;
        writeln!(out, "## Anomalies")?;
        writeln!(out)?;
        if self.anomalies.is_empty() {
            writeln!(out, "None.")?;
        }
        for anomaly in &self.anomalies {
            writeln!(out, "- [{}] {}", anomaly.severity(), anomaly.describe())?;
        }

        if let Some(activity) = &self.activity {
            writeln!(out)?;
            writeln!(out, "## Activity")?;
            writeln!(out)?;
            writeln!(
                out,
                "{} entries from {} actors.",
                activity.total_entries, activity.unique_actors
            )?;
            for (action, count) in &activity.actions_by_type {
                writeln!(out, "- {action}: {count}")?;
            }
        }

        Ok(())
    }
}
