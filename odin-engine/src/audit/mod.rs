//! Append-only audit trail, one JSON-lines file per UTC date.
//!
//! Lines are only ever appended. Reads are a linear scan of the relevant
//! date files; volumes are small enough that no index is kept.

pub mod anomaly;
pub mod report;

pub use anomaly::{detect, Anomaly};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const FILE_PREFIX: &str = "audit_";
const FILE_SUFFIX: &str = ".jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub details: Value,
    pub severity: Severity,
}

impl AuditLogEntry {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        details: Value,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            details,
            severity,
        }
    }
}

/// Query filters. Every set field must match; `text` is a case-insensitive
/// substring search over the serialized entry.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub severity: Option<Severity>,
    pub text: Option<String>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        if self.actor.as_deref().is_some_and(|a| a != entry.actor)
            || self.action.as_deref().is_some_and(|a| a != entry.action)
            || self.resource.as_deref().is_some_and(|r| r != entry.resource)
            || self.severity.is_some_and(|s| s != entry.severity)
        {
            return false;
        }

        match &self.text {
            Some(text) => serde_json::to_string(entry)
                .map(|s| s.to_lowercase().contains(&text.to_lowercase()))
                .unwrap_or(false),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub total_entries: usize,
    pub unique_actors: usize,
    pub actions_by_type: BTreeMap<String, usize>,
    pub severity_distribution: BTreeMap<Severity, usize>,
}

pub fn summarize(entries: &[AuditLogEntry]) -> AuditSummary {
    let mut summary = AuditSummary {
        total_entries: entries.len(),
        severity_distribution: [Severity::Info, Severity::Warning, Severity::Error]
            .into_iter()
            .map(|s| (s, 0))
            .collect(),
        ..Default::default()
    };
    let mut actors = BTreeSet::new();

    for entry in entries {
        *summary.actions_by_type.entry(entry.action.clone()).or_default() += 1;
        *summary.severity_distribution.entry(entry.severity).or_default() += 1;
        actors.insert(entry.actor.as_str());
    }
    summary.unique_actors = actors.len();
    summary
}

/// Date-partitioned audit log directory.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    dir: PathBuf,
}

impl AuditTrail {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", date.format("%Y-%m-%d")))
    }

    /// Append one entry to the file for its UTC date.
    pub fn append(&self, entry: &AuditLogEntry) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut line = serde_json::to_vec(entry).map_err(io::Error::other)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(entry.timestamp.date_naive()))?;
        // Single write so concurrent appenders never interleave within a line.
        file.write_all(&line)
    }

    /// Build, append and return an entry.
    pub fn log(
        &self,
        actor: &str,
        action: &str,
        resource: &str,
        details: Value,
        severity: Severity,
    ) -> io::Result<AuditLogEntry> {
        let entry = AuditLogEntry::new(actor, action, resource, details, severity);
        self.append(&entry)?;
        debug!(action, resource, "Audit entry written");
        Ok(entry)
    }

    /// Like [`log`](Self::log) but a failure is only a warning. Used from
    /// operations whose outcome must not depend on the audit trail.
    pub fn log_quietly(&self, actor: &str, action: &str, resource: &str, details: Value, severity: Severity) {
        if let Err(e) = self.log(actor, action, resource, details, severity) {
            warn!("Failed to write audit entry {}: {}", action, e);
        }
    }

    /// Entries in `[from, to]` (either bound optional) matching `filter`,
    /// oldest first. Malformed lines are skipped.
    pub fn query(
        &self,
        filter: &AuditFilter,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> io::Result<Vec<AuditLogEntry>> {
        let mut matches = Vec::new();

        for (date, path) in self.files()? {
            if from.is_some_and(|f| date < f.date_naive()) || to.is_some_and(|t| date > t.date_naive()) {
                continue;
            }

            let mut reader = BufReader::new(fs::File::open(&path)?);
            let mut line = Vec::new();
            let mut number = 0;
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line)? == 0 {
                    break;
                }
                number += 1;
                if line.trim_ascii().is_empty() {
                    continue;
                }
                let entry: AuditLogEntry = match serde_json::from_slice(&line) {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Skipping malformed audit line {}:{}: {}", path.display(), number, e);
                        continue;
                    }
                };

                if from.is_some_and(|f| entry.timestamp < f) || to.is_some_and(|t| entry.timestamp > t) {
                    continue;
                }
                if filter.matches(&entry) {
                    matches.push(entry);
                }
            }
        }

        matches.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        if let Some(limit) = filter.limit {
            // Keep the most recent `limit` entries.
            let excess = matches.len().saturating_sub(limit);
            matches.drain(..excess);
        }
        Ok(matches)
    }

    /// Anomalies among the entries of the last `window`.
    pub fn detect_anomalies(
        &self,
        window: chrono::Duration,
        config: &crate::config::AuditConfig,
    ) -> io::Result<Vec<Anomaly>> {
        let now = Utc::now();
        let entries = self.query(&AuditFilter::default(), Some(now - window), Some(now))?;
        Ok(detect(&entries, config))
    }

    /// Date-partition files present, sorted by date.
    fn files(&self) -> io::Result<Vec<(NaiveDate, PathBuf)>> {
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files: Vec<_> = read
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let date = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
                let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
                Some((date, entry.path()))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry_at(at: DateTime<Utc>, actor: &str, action: &str, severity: Severity) -> AuditLogEntry {
        AuditLogEntry {
            timestamp: at,
            ..AuditLogEntry::new(actor, action, "res", json!({"n": 1}), severity)
        }
    }

    #[test]
    fn test_log_appends_to_date_file() {
        let temp_dir = TempDir::new().unwrap();
        let trail = AuditTrail::new(temp_dir.path());

        let first = trail.log("odin", "backup_created", "b1", json!({}), Severity::Info).unwrap();
        trail.log("odin", "rollback_completed", "b1", json!({}), Severity::Warning).unwrap();

        let path = trail.file_for(first.timestamp.date_naive());
        let content = fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(Uuid::parse_str(&first.id).is_ok());
    }

    #[test]
    fn test_query_filters_and_range() {
        let temp_dir = TempDir::new().unwrap();
        let trail = AuditTrail::new(temp_dir.path());
        let day1 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();

        trail.append(&entry_at(day1, "alice", "backup_created", Severity::Info)).unwrap();
        trail.append(&entry_at(day2, "bob", "rollback_failed", Severity::Error)).unwrap();
        trail.append(&entry_at(day2, "alice", "cleanup", Severity::Info)).unwrap();

        let all = trail.query(&AuditFilter::default(), None, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, day1);

        let alice = AuditFilter {
            actor: Some("alice".into()),
            ..Default::default()
        };
        assert_eq!(trail.query(&alice, None, None).unwrap().len(), 2);
        assert_eq!(trail.query(&alice, Some(day2), None).unwrap().len(), 1);

        let errors = AuditFilter {
            severity: Some(Severity::Error),
            ..Default::default()
        };
        assert_eq!(trail.query(&errors, None, None).unwrap()[0].actor, "bob");

        let text = AuditFilter {
            text: Some("ROLLBACK".into()),
            ..Default::default()
        };
        assert_eq!(trail.query(&text, None, None).unwrap().len(), 1);

        let limited = AuditFilter {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(trail.query(&limited, None, None).unwrap()[0].action, "cleanup");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let trail = AuditTrail::new(temp_dir.path());
        let entry = trail.log("odin", "init", "", json!(null), Severity::Info).unwrap();

        let path = trail.file_for(entry.timestamp.date_naive());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{ truncated").unwrap();

        assert_eq!(trail.query(&AuditFilter::default(), None, None).unwrap(), vec![entry]);
    }

    #[test]
    fn test_non_utf8_line_does_not_hide_the_rest() {
        let temp_dir = TempDir::new().unwrap();
        let trail = AuditTrail::new(temp_dir.path());
        let first = trail.log("odin", "init", "", json!(null), Severity::Info).unwrap();

        let path = trail.file_for(first.timestamp.date_naive());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"\xff\xfe garbage\n").unwrap();
        drop(file);
        let second = trail.log("odin", "backup_created", "b1", json!(null), Severity::Info).unwrap();

        let entries = trail.query(&AuditFilter::default(), None, None).unwrap();
        assert_eq!(entries, vec![first, second]);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let trail = AuditTrail::new(temp_dir.path().join("none"));
        assert!(trail.query(&AuditFilter::default(), None, None).unwrap().is_empty());
    }

    #[test]
    fn test_summarize() {
        let now = Utc::now();
        let entries = vec![
            entry_at(now, "a", "backup_created", Severity::Info),
            entry_at(now, "b", "backup_created", Severity::Error),
            entry_at(now, "a", "cleanup", Severity::Info),
        ];
        let summary = summarize(&entries);
        assert_eq!(summary.total_entries, 3);
        assert_eq!(summary.unique_actors, 2);
        assert_eq!(summary.actions_by_type["backup_created"], 2);
        assert_eq!(summary.severity_distribution[&Severity::Info], 2);
        assert_eq!(summary.severity_distribution[&Severity::Warning], 0);
    }
}
