//! ODIN project integrity engine
//!
//! Semantic drift detection over a project tree, self-contained backup
//! records with rollback, checkpoints, retention and an append-only audit
//! trail, coordinated by a per-project instance lock.

pub mod audit;
pub mod backup;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod fs;
pub mod integrity;
pub mod layout;
pub mod retention;
pub mod rollback;
pub mod state;
pub mod utils;
pub mod vcs;

// Re-export commonly used types
pub use backup::{BackupManager, BackupRecord, BackupScope, BackupSummary};
pub use config::OdinConfig;
pub use daemon::{LockGuard, LockOptions};
pub use engine::OdinEngine;
pub use integrity::{DriftReport, IntegrityMonitor, Snapshot, SnapshotIndex};
pub use rollback::{RollbackEngine, RollbackOutcome};
pub use utils::errors::{OdinError, Result};
