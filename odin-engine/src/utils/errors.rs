//! Error types for the integrity, backup and rollback engine.
//!
//! Each component has its own enum so callers can match on the failures that
//! matter to them; `OdinError` wraps them all for the facade and the CLI.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("No baseline captured; call capture_baseline() first")]
    NoBaseline,

    #[error("Project root is not a directory: {0}")]
    InvalidRoot(PathBuf),

    #[error("Walk error under {root}: {message}")]
    Walk { root: PathBuf, message: String },
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Failed to write backup record {path}: {source}")]
    RecordWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize backup record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Backup record not found: {0}")]
    NotFound(String),

    #[error("Backup record {id} is unreadable: {message}")]
    Corrupt { id: String, message: String },

    #[error("Snapshot failed: {0}")]
    Snapshot(#[from] IntegrityError),

    #[error("Lock {lock} is not the instance lock of {root}")]
    ForeignLock { lock: PathBuf, root: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum RollbackError {
    #[error("Backup record not found: {0}")]
    NotFound(String),

    #[error("Could not create safety backup before rollback: {0}")]
    SafetyCheckpointFailed(#[source] BackupError),

    #[error("Rollback restored {restored} files with {} errors (safety backup: {safety_record_id})", errors.len())]
    PartialRestore {
        restored: usize,
        errors: Vec<String>,
        safety_record_id: String,
    },

    #[error("Backup record {id} is unusable: {message}")]
    InvalidRecord { id: String, message: String },
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Another instance (pid {pid}) is running for this project and could not be stopped")]
    AlreadyRunning { pid: u32 },

    #[error("Timed out after {0:?} waiting for the instance lock")]
    AcquireTimeout(std::time::Duration),

    #[error("Lock file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Error, Debug)]
pub enum OdinError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OdinError>;
