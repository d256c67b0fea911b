//! Heuristic anomaly signals over a window of audit entries.
//!
//! These are hints for a human, not guarantees: thresholds are fixed per
//! configuration and nothing here blocks an operation.

use super::{AuditLogEntry, Severity};
use crate::config::AuditConfig;
use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anomaly {
    HighFrequencyActor {
        actor: String,
        count: usize,
        threshold: usize,
    },
    UnusualHourActivity {
        timestamp: DateTime<Utc>,
        actor: String,
        action: String,
    },
    HighFailureRate {
        failure_ratio: f64,
        failed_count: usize,
        total_count: usize,
    },
}

impl Anomaly {
    pub fn severity(&self) -> &'static str {
        match self {
            Anomaly::HighFrequencyActor { .. } => "medium",
            Anomaly::UnusualHourActivity { .. } => "low",
            Anomaly::HighFailureRate { .. } => "high",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Anomaly::HighFrequencyActor { actor, count, threshold } => {
                format!("actor '{actor}' logged {count} actions (threshold {threshold})")
            }
            Anomaly::UnusualHourActivity { timestamp, actor, action } => {
                format!("'{action}' by '{actor}' at {}", timestamp.format("%Y-%m-%d %H:%M UTC"))
            }
            Anomaly::HighFailureRate { failure_ratio, failed_count, total_count } => format!(
                "{failed_count} of {total_count} actions failed ({:.0}%)",
                failure_ratio * 100.0
            ),
        }
    }
}

pub fn detect(entries: &[AuditLogEntry], config: &AuditConfig) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    let mut per_actor: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in entries {
        *per_actor.entry(entry.actor.as_str()).or_default() += 1;
    }
    anomalies.extend(
        per_actor
            .into_iter()
            .filter(|(_, count)| *count > config.high_frequency_actor)
            .map(|(actor, count)| Anomaly::HighFrequencyActor {
                actor: actor.to_string(),
                count,
                threshold: config.high_frequency_actor,
            }),
    );

    anomalies.extend(
        entries
            .iter()
            .filter(|e| config.unusual_hours.contains(&e.timestamp.hour()))
            .map(|e| Anomaly::UnusualHourActivity {
                timestamp: e.timestamp,
                actor: e.actor.clone(),
                action: e.action.clone(),
            }),
    );

    if !entries.is_empty() {
        let failed_count = entries.iter().filter(|e| e.severity == Severity::Error).count();
        let failure_ratio = failed_count as f64 / entries.len() as f64;
        if failure_ratio > config.failure_ratio {
            anomalies.push(Anomaly::HighFailureRate {
                failure_ratio,
                failed_count,
                total_count: entries.len(),
            });
        }
    }

    anomalies
}
